//! The datacenter inventory schema.

use crate::datatype::FieldType;
use crate::error::Result;
use crate::schema::{EntityType, Schema};

pub fn schema() -> Result<Schema> {
    Schema::builder()
        .entity(EntityType::builder("Site").field("name", FieldType::String).field("address", FieldType::Text).named("{name}"))
        .entity(
            EntityType::builder("Rack")
                .field("name", FieldType::String)
                .required_to_one("site", "Site")
                .to_many("devices", "Device", "rack")
                .named("{name}.{site.name}"),
        )
        .entity(
            EntityType::builder("Device")
                .field("hid", FieldType::String)
                .field("hw_class", FieldType::String)
                .field_default("status", FieldType::String, "inventory")
                .field_default("notes", FieldType::Text, "")
                .field("rackpos", FieldType::Int)
                .field("serialno", FieldType::String)
                .field("purchased", FieldType::Date)
                .required_to_one("rack", "Rack")
                .to_one("chassis", "Chassis")
                .to_many("ports", "Port", "device")
                .named("{hid}"),
        )
        .entity(
            EntityType::builder("Chassis")
                .field("vendor", FieldType::String)
                .field("model", FieldType::String)
                .field("units", FieldType::Int)
                .named("{vendor}_{model}")
                .unrevisioned(),
        )
        .entity(EntityType::builder("Pod").field("name", FieldType::String).named("{name}"))
        .entity(
            EntityType::builder("Host")
                .field("name", FieldType::String)
                .field_default("enabled", FieldType::Bool, true)
                .field("last_seen", FieldType::DateTime)
                .field("lease", FieldType::Duration)
                .field("load", FieldType::Float)
                .required_to_one("pod", "Pod")
                .to_one("device", "Device")
                .to_many("interfaces", "Interface", "host")
                .named("{name}.{pod.name}.{device.rack.site.name}"),
        )
        .entity(
            EntityType::builder("Port")
                .field("mac", FieldType::String)
                .field("name", FieldType::String)
                .to_one("device", "Device")
                .named("{mac}_{name}"),
        )
        .entity(
            EntityType::builder("Interface")
                .field("port_name", FieldType::String)
                .field("ifindex", FieldType::Int)
                .required_to_one("host", "Host")
                .to_one("address", "IpAddress")
                .named("{host.instance_name}_{port_name}(_{ifindex})"),
        )
        .entity(
            EntityType::builder("Subnet")
                .field("addr", FieldType::String)
                .field("mask_len", FieldType::Int)
                .to_one("site", "Site")
                .to_many("addresses", "IpAddress", "subnet")
                .named("{addr}_{mask_len}"),
        )
        .entity(
            EntityType::builder("IpAddress")
                .field("value", FieldType::String)
                .required_to_one("subnet", "Subnet")
                .named("{value}.{subnet.site.name}"),
        )
        .entity(EntityType::builder("Note").field("text", FieldType::Text).to_one("host", "Host"))
        .build()
}
