use crate::error::ValidationError;
use crate::model::schema::{Field, FieldType, Props, Schema};
use crate::model::types::{choice_enum, ControllerType, DiskLocation, MemoryMB, ProcessorCount};
use crate::model::ResourceKind;
use crate::policy::FieldPolicy;

choice_enum! {
    /// Action taken for the VM when the host starts.
    pub enum AutoStartAction {
        Nothing => "Nothing",
        StartIfRunning => "StartIfRunning",
        Start => "Start",
    }
}

choice_enum! {
    /// Action taken for the VM when the host shuts down.
    pub enum AutoStopAction {
        TurnOff => "TurnOff",
        Save => "Save",
        ShutDown => "ShutDown",
    }
}

const FIELDS: &[Field] = &[
    Field::new("machineName", FieldType::String, FieldPolicy::Replace).required(),
    Field::new("generation", FieldType::Int, FieldPolicy::Replace),
    Field::new("processorCount", FieldType::Int, FieldPolicy::Update),
    Field::new("memorySize", FieldType::Int, FieldPolicy::Update),
    Field::new("dynamicMemory", FieldType::Bool, FieldPolicy::Update),
    Field::new("minimumMemory", FieldType::Int, FieldPolicy::Update),
    Field::new("maximumMemory", FieldType::Int, FieldPolicy::Update),
    Field::new("autoStartAction", FieldType::String, FieldPolicy::Update),
    Field::new("autoStopAction", FieldType::String, FieldPolicy::Update),
    Field::new("networkAdapters", FieldType::List, FieldPolicy::Update),
    Field::new("hardDrives", FieldType::List, FieldPolicy::Update),
];

const NETWORK_ADAPTER_FIELDS: &[Field] = &[
    Field::new("name", FieldType::String, FieldPolicy::Update),
    Field::new("switchName", FieldType::String, FieldPolicy::Update).required(),
];

const HARD_DRIVE_FIELDS: &[Field] = &[
    Field::new("path", FieldType::String, FieldPolicy::Update).required(),
    Field::new("controllerType", FieldType::String, FieldPolicy::Update),
    Field::new("controllerNumber", FieldType::Int, FieldPolicy::Update),
    Field::new("controllerLocation", FieldType::Int, FieldPolicy::Update),
];

pub(crate) static SCHEMA: Schema = Schema {
    kind: ResourceKind::Machine,
    fields: FIELDS,
    identity: &["machineName"],
    lock: ("vm", "machineName"),
    check,
};

fn memory_in_range(mb: i64) -> bool {
    u64::try_from(mb).ok().and_then(MemoryMB::new).is_some()
}

fn check(props: &mut Props<'_>) -> Result<(), ValidationError> {
    props.non_empty("machineName")?;

    props.default("generation", 2i64);
    props.int_in("generation", |g| g == 1 || g == 2, "generation 1 or 2")?;

    props.default("processorCount", i64::from(ProcessorCount::default().get()));
    props.positive("processorCount")?;
    props.int_in(
        "processorCount",
        |n| u32::try_from(n).ok().and_then(ProcessorCount::new).is_some(),
        "1..=240",
    )?;

    props.default("memorySize", MemoryMB::default().as_mb() as i64);
    props.positive("memorySize")?;
    props.int_in("memorySize", memory_in_range, "32 MB..=12 TB")?;

    props.default("dynamicMemory", false);
    let minimum = props.positive("minimumMemory")?;
    let maximum = props.positive("maximumMemory")?;
    props.int_in("minimumMemory", memory_in_range, "32 MB..=12 TB")?;
    props.int_in("maximumMemory", memory_in_range, "32 MB..=12 TB")?;
    if let (Some(min), Some(max)) = (minimum, maximum) {
        if min > max {
            return Err(props.invalid(
                "minimumMemory",
                format!("minimum {min} MB exceeds maximum {max} MB"),
            ));
        }
    }
    if props.bool("dynamicMemory") == Some(false)
        && (props.has("minimumMemory") || props.has("maximumMemory"))
    {
        return Err(props.invalid(
            "dynamicMemory",
            "minimumMemory/maximumMemory require dynamic memory",
        ));
    }

    props.default("autoStartAction", AutoStartAction::Nothing.as_str());
    props.choice::<AutoStartAction>("autoStartAction")?;
    props.default("autoStopAction", AutoStopAction::TurnOff.as_str());
    props.choice::<AutoStopAction>("autoStopAction")?;

    props.each_item("networkAdapters", |nic| {
        nic.check_fields(NETWORK_ADAPTER_FIELDS)?;
        nic.non_empty("switchName")
    })?;

    props.each_item("hardDrives", |drive| {
        drive.check_fields(HARD_DRIVE_FIELDS)?;
        drive.non_empty("path")?;
        drive.default("controllerType", ControllerType::Scsi.as_str());
        drive.default("controllerNumber", 0i64);
        drive.default("controllerLocation", 0i64);
        let controller_type = drive.choice::<ControllerType>("controllerType")?;
        let number = drive.int("controllerNumber");
        let location = drive.int("controllerLocation");
        if let (Some(kind), Some(number), Some(location)) = (controller_type, number, location) {
            let slot = u32::try_from(number)
                .ok()
                .zip(u32::try_from(location).ok())
                .and_then(|(n, l)| DiskLocation::new(kind, n, l));
            if slot.is_none() {
                return Err(drive.invalid(
                    "controllerLocation",
                    format!("{kind} controller {number} has no location {location}"),
                ));
            }
        }
        Ok(())
    })
}
