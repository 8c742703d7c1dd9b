//! Admission checks for user-supplied specs.
//!
//! Each check collects every problem it finds as a [`FieldErrors`] list so that a rejected write
//! reports all of its faults at once.

use crate::{
    core::{pool::ProvisioningStrategy, property, FieldErrors},
    k8s::{
        AccessCodeSpec, Availability, EnvironmentSpec, MachineSetSpec, OneTimeAccessCodeSetSpec,
        OneTimeAccessCodeSpec, ProviderSpec, ScheduledEventSpec, Validity,
    },
};

/// The machine information key every provider must report.
const PRIMARY_ADDRESS: &str = "primary_address";

fn validity(prefix: &str, validity: &Validity, errors: &mut FieldErrors) {
    if let (Some(not_before), Some(not_after)) = (validity.not_before, validity.not_after) {
        if not_after < not_before {
            errors.push(
                format!("{prefix}.notAfter"),
                format_args!("must not precede notBefore ({not_before})"),
            );
        }
    }
}

fn one_time_access_code(prefix: &str, spec: &OneTimeAccessCodeSpec, errors: &mut FieldErrors) {
    validity(prefix, &spec.validity, errors);
    if spec.max_duration.is_some_and(|d| d.as_std().is_zero()) {
        errors.push(format!("{prefix}.maxDuration"), "must be positive");
    }
}

pub(crate) fn access_code(spec: &AccessCodeSpec) -> FieldErrors {
    let mut errors = FieldErrors::default();
    validity("spec", &spec.validity, &mut errors);
    errors
}

pub(crate) fn otac(spec: &OneTimeAccessCodeSpec) -> FieldErrors {
    let mut errors = FieldErrors::default();
    one_time_access_code("spec", spec, &mut errors);
    errors
}

pub(crate) fn otac_set(spec: &OneTimeAccessCodeSetSpec) -> FieldErrors {
    let mut errors = FieldErrors::default();
    one_time_access_code("spec.template", &spec.template, &mut errors);
    errors
}

pub(crate) fn scheduled_event(spec: &ScheduledEventSpec) -> FieldErrors {
    let mut errors = FieldErrors::default();
    let start = spec
        .start()
        .map_err(|error| errors.push("spec.startTime", error))
        .ok();
    let end = spec
        .end()
        .map_err(|error| errors.push("spec.endTime", error))
        .ok();
    let provisioning_start = match spec.provisioning_start_time {
        Some(_) => spec
            .provisioning_start()
            .map_err(|error| errors.push("spec.provisioningStartTime", error))
            .ok(),
        None => None,
    };

    if let (Some(start), Some(end)) = (start, end) {
        if end <= start {
            errors.push("spec.endTime", "must follow startTime");
        }
    }
    if let (Some(provisioning_start), Some(start)) = (provisioning_start, start) {
        if provisioning_start > start {
            errors.push("spec.provisioningStartTime", "must not follow startTime");
        }
    }

    if spec.access_code.is_empty() {
        errors.push("spec.accessCode", "required value is missing");
    }
    for (environment, templates) in &spec.required_machines {
        for (template, count) in templates {
            if *count == 0 {
                errors.push(
                    format!("spec.requiredMachines[{environment}][{template}]"),
                    "must request at least one machine",
                );
            }
        }
    }
    errors
}

pub(crate) fn machine_set(spec: &MachineSetSpec) -> FieldErrors {
    let mut errors = FieldErrors::default();
    if spec.environment.is_empty() {
        errors.push("spec.environment", "required value is missing");
    }
    if spec.machine_template.is_empty() {
        errors.push("spec.machineTemplate", "required value is missing");
    }
    if spec.provisioning_strategy == ProvisioningStrategy::AutoScale
        && spec.min_available > spec.max_provisioned
    {
        errors.push(
            "spec.minAvailable",
            format_args!("must not exceed maxProvisioned ({})", spec.max_provisioned),
        );
    }
    match spec.availability {
        Availability::AccessCode if spec.access_code.is_none() => {
            errors.push("spec.accessCode", "required for AccessCode availability");
        }
        Availability::ScheduledEvent if spec.scheduled_event.is_none() => {
            errors.push(
                "spec.scheduledEvent",
                "required for ScheduledEvent availability",
            );
        }
        _ => {}
    }
    errors
}

pub(crate) fn provider(spec: &ProviderSpec) -> FieldErrors {
    let mut errors = FieldErrors::default();
    for (name, property) in &spec.provider_configuration {
        property.validate_definition(&format!("spec.providerConfiguration.{name}"), &mut errors);
    }
    for (name, property) in &spec.machine_information {
        property.validate_definition(&format!("spec.machineInformation.{name}"), &mut errors);
    }
    if !spec.machine_information.contains_key(PRIMARY_ADDRESS) {
        errors.push(
            format!("spec.machineInformation.{PRIMARY_ADDRESS}"),
            "required property is not declared",
        );
    }
    errors
}

/// Checks an environment's configuration against the properties its provider declares.
///
/// Template overrides are partial, so only the values they set are checked.
pub(crate) fn environment(spec: &EnvironmentSpec, provider: Option<&ProviderSpec>) -> FieldErrors {
    let mut errors = FieldErrors::default();
    if spec.provider.is_empty() {
        errors.push("spec.provider", "required value is missing");
        return errors;
    }
    let Some(provider) = provider else {
        errors.push(
            "spec.provider",
            format_args!("provider {} not found", spec.provider),
        );
        return errors;
    };

    let properties = &provider.provider_configuration;
    property::validate_configuration(
        "spec.providerConfiguration",
        properties,
        &spec.provider_configuration,
        &mut errors,
    );
    for (template, values) in &spec.template_configuration {
        for (name, value) in values {
            let field = format!("spec.templateConfiguration[{template}].{name}");
            match properties.get(name) {
                Some(property) => property.validate(&field, Some(value), &mut errors),
                None => errors.push(field, "unknown property"),
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        property::{IntegerValidation, Property, PropertyDef, StringValidation},
        timestamp,
    };
    use chrono::{Duration, TimeZone, Utc};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn fields(errors: &FieldErrors) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    fn string() -> Property {
        Property::String(PropertyDef::<StringValidation>::default())
    }

    fn integer(min: i64, max: i64) -> Property {
        Property::Integer(PropertyDef {
            validation: IntegerValidation {
                minimum: Some(min),
                maximum: Some(max),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn access_code_windows_are_ordered() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut spec = AccessCodeSpec {
            validity: Validity {
                not_before: Some(now),
                not_after: Some(now + Duration::hours(1)),
            },
            ..Default::default()
        };
        assert!(access_code(&spec).is_empty());

        spec.validity.not_after = Some(now - Duration::hours(1));
        assert_eq!(fields(&access_code(&spec)), vec!["spec.notAfter"]);
    }

    #[test]
    fn otac_set_checks_its_template() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let spec = OneTimeAccessCodeSetSpec {
            count: 3,
            template: OneTimeAccessCodeSpec {
                validity: Validity {
                    not_before: Some(now),
                    not_after: Some(now - Duration::minutes(1)),
                },
                max_duration: Some(std::time::Duration::ZERO.into()),
                ..Default::default()
            },
        };
        assert_eq!(
            fields(&otac_set(&spec)),
            vec!["spec.template.notAfter", "spec.template.maxDuration"]
        );
        assert!(otac(&OneTimeAccessCodeSpec::default()).is_empty());
    }

    #[test]
    fn scheduled_event_times_are_ordered() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut spec = ScheduledEventSpec {
            start_time: timestamp::format(start),
            end_time: timestamp::format(start + Duration::hours(2)),
            access_code: "ev1".to_string(),
            required_machines: btreemap! {
                "env1".to_string() => btreemap! { "small".to_string() => 2 },
            },
            ..Default::default()
        };
        assert!(scheduled_event(&spec).is_empty());

        spec.end_time = timestamp::format(start - Duration::hours(1));
        spec.provisioning_start_time = Some(timestamp::format(start + Duration::minutes(5)));
        assert_eq!(
            fields(&scheduled_event(&spec)),
            vec!["spec.endTime", "spec.provisioningStartTime"]
        );

        spec.start_time = "noon".to_string();
        spec.access_code.clear();
        spec.required_machines = btreemap! {
            "env1".to_string() => btreemap! { "small".to_string() => 0 },
        };
        assert_eq!(
            fields(&scheduled_event(&spec)),
            vec![
                "spec.startTime",
                "spec.accessCode",
                "spec.requiredMachines[env1][small]",
            ]
        );
    }

    #[test]
    fn machine_set_bounds() {
        let mut spec = MachineSetSpec {
            environment: "env1".to_string(),
            machine_template: "small".to_string(),
            min_available: 2,
            max_provisioned: 4,
            ..Default::default()
        };
        assert!(machine_set(&spec).is_empty());

        spec.min_available = 5;
        spec.availability = Availability::AccessCode;
        assert_eq!(
            fields(&machine_set(&spec)),
            vec!["spec.minAvailable", "spec.accessCode"]
        );

        spec.provisioning_strategy = ProvisioningStrategy::OnDemand;
        spec.access_code = Some("ac".to_string());
        assert!(machine_set(&spec).is_empty());
    }

    #[test]
    fn providers_declare_primary_address() {
        let mut spec = ProviderSpec {
            provider_configuration: btreemap! {
                "cpus".to_string() => integer(4, 1),
            },
            machine_information: btreemap! {},
        };
        let errors = provider(&spec);
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .any(|e| e.field.starts_with("spec.providerConfiguration.cpus")));
        assert!(errors
            .iter()
            .any(|e| e.field == "spec.machineInformation.primary_address"));

        spec.provider_configuration = btreemap! { "cpus".to_string() => integer(1, 4) };
        spec.machine_information = btreemap! { PRIMARY_ADDRESS.to_string() => string() };
        assert!(provider(&spec).is_empty());
    }

    #[test]
    fn environment_configuration_follows_provider() {
        let provider = ProviderSpec {
            provider_configuration: btreemap! {
                "cpus".to_string() => integer(1, 4),
                "image".to_string() => string(),
            },
            machine_information: btreemap! { PRIMARY_ADDRESS.to_string() => string() },
        };
        let mut spec = EnvironmentSpec {
            provider: "aws".to_string(),
            provider_configuration: btreemap! {
                "cpus".to_string() => "2".to_string(),
            },
            template_configuration: btreemap! {
                "small".to_string() => btreemap! { "cpus".to_string() => "1".to_string() },
            },
            ..Default::default()
        };
        assert!(environment(&spec, Some(&provider)).is_empty());

        spec.provider_configuration
            .insert("cpus".to_string(), "8".to_string());
        spec.template_configuration = btreemap! {
            "small".to_string() => btreemap! { "disk".to_string() => "10".to_string() },
        };
        assert_eq!(
            fields(&environment(&spec, Some(&provider))),
            vec![
                "spec.providerConfiguration.cpus",
                "spec.templateConfiguration[small].disk",
            ]
        );

        assert_eq!(fields(&environment(&spec, None)), vec!["spec.provider"]);
    }
}
