use crate::error::ValidationError;
use crate::model::schema::{Field, FieldType, Props, Schema};
use crate::model::types::{choice_enum, MacAddress, VlanId, VmqWeight};
use crate::model::{ResourceKind, Value};
use crate::policy::FieldPolicy;

choice_enum! {
    /// Port mirroring mode of a VM network adapter.
    pub enum PortMirroring {
        None => "None",
        Source => "Source",
        Destination => "Destination",
        Both => "Both",
    }
}

const FIELDS: &[Field] = &[
    Field::new("name", FieldType::String, FieldPolicy::Replace).required(),
    Field::new("vmName", FieldType::String, FieldPolicy::Replace).required(),
    Field::new("switchName", FieldType::String, FieldPolicy::Update).required(),
    Field::new("macAddress", FieldType::String, FieldPolicy::Update),
    Field::new("vlanId", FieldType::Int, FieldPolicy::Update),
    Field::new("dhcpGuard", FieldType::Bool, FieldPolicy::Update),
    Field::new("routerGuard", FieldType::Bool, FieldPolicy::Update),
    Field::new("portMirroring", FieldType::String, FieldPolicy::Update),
    Field::new("ieeePriorityTag", FieldType::Bool, FieldPolicy::Update),
    Field::new("vmqWeight", FieldType::Int, FieldPolicy::Update),
];

pub(crate) static SCHEMA: Schema = Schema {
    kind: ResourceKind::Adapter,
    fields: FIELDS,
    identity: &["vmName", "name"],
    lock: ("vm", "vmName"),
    check,
};

fn check(props: &mut Props<'_>) -> Result<(), ValidationError> {
    props.non_empty("name")?;
    props.non_empty("vmName")?;
    props.non_empty("switchName")?;

    if let Some(raw) = props.str("macAddress") {
        let mac = MacAddress::parse(raw)
            .ok_or_else(|| props.invalid("macAddress", format!("'{raw}' is not a MAC address")))?;
        props.set("macAddress", Value::from(mac.as_str()));
    }

    props.int_in("vlanId", |id| VlanId::new(id).is_some(), "1..=4094")?;
    props.int_in("vmqWeight", |w| VmqWeight::new(w).is_some(), "0..=100")?;

    props.default("dhcpGuard", false);
    props.default("routerGuard", false);
    props.default("portMirroring", PortMirroring::None.as_str());
    props.choice::<PortMirroring>("portMirroring")?;
    Ok(())
}
