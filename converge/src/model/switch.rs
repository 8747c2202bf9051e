use crate::error::ValidationError;
use crate::model::schema::{Field, FieldType, Props, Schema};
use crate::model::types::choice_enum;
use crate::model::ResourceKind;
use crate::policy::FieldPolicy;

choice_enum! {
    /// Virtual switch type.
    pub enum SwitchType {
        External => "External",
        Internal => "Internal",
        Private => "Private",
    }
}

const FIELDS: &[Field] = &[
    Field::new("name", FieldType::String, FieldPolicy::Replace).required(),
    Field::new("switchType", FieldType::String, FieldPolicy::Replace).required(),
    Field::new("netAdapterName", FieldType::String, FieldPolicy::Replace),
    Field::new("notes", FieldType::String, FieldPolicy::Update),
    Field::new("allowManagementOs", FieldType::Bool, FieldPolicy::Update),
];

pub(crate) static SCHEMA: Schema = Schema {
    kind: ResourceKind::Switch,
    fields: FIELDS,
    identity: &["name"],
    lock: ("switch", "name"),
    check,
};

fn check(props: &mut Props<'_>) -> Result<(), ValidationError> {
    props.non_empty("name")?;
    let switch_type = props.choice::<SwitchType>("switchType")?;

    if switch_type == Some(SwitchType::External) && !props.has("netAdapterName") {
        return Err(props.invalid(
            "netAdapterName",
            "External switch requires a physical network adapter",
        ));
    }

    props.default("allowManagementOs", false);
    Ok(())
}
