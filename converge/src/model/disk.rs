use crate::error::ValidationError;
use crate::model::schema::{Field, FieldType, Props, Schema};
use crate::model::types::{choice_enum, BlockSize};
use crate::model::ResourceKind;
use crate::policy::FieldPolicy;

choice_enum! {
    /// Virtual hard disk allocation type.
    pub enum DiskType {
        Fixed => "Fixed",
        Dynamic => "Dynamic",
        Differencing => "Differencing",
    }
}

const FIELDS: &[Field] = &[
    Field::new("path", FieldType::String, FieldPolicy::Replace).required(),
    Field::new("sizeBytes", FieldType::Int, FieldPolicy::GrowOnly).required(),
    Field::new("diskType", FieldType::String, FieldPolicy::Replace),
    Field::new("parentPath", FieldType::String, FieldPolicy::Replace),
    Field::new("blockSize", FieldType::Int, FieldPolicy::Replace),
];

pub(crate) static SCHEMA: Schema = Schema {
    kind: ResourceKind::Disk,
    fields: FIELDS,
    identity: &["path"],
    lock: ("disk", "path"),
    check,
};

fn check(props: &mut Props<'_>) -> Result<(), ValidationError> {
    props.non_empty("path")?;
    props.positive("sizeBytes")?;

    props.default("diskType", DiskType::Dynamic.as_str());
    let disk_type = props.choice::<DiskType>("diskType")?;
    match disk_type {
        Some(DiskType::Differencing) if !props.has("parentPath") => {
            return Err(props.invalid("parentPath", "Differencing disk requires a parent path"));
        }
        Some(DiskType::Fixed | DiskType::Dynamic) if props.has("parentPath") => {
            return Err(props.invalid(
                "parentPath",
                "only Differencing disks have a parent",
            ));
        }
        _ => {}
    }
    props.non_empty("parentPath")?;

    props.default("blockSize", i64::from(BlockSize::default().as_bytes()));
    if let Some(bytes) = props.int("blockSize") {
        if BlockSize::from_bytes(bytes).is_none() {
            return Err(props.invalid(
                "blockSize",
                format!("{bytes} is not a supported VHD block size"),
            ));
        }
    }
    Ok(())
}
