use chrono::NaiveDate;
use futures::StreamExt;
use std::sync::Arc;

use hl7_processor::transform::{
    ConditionOperator, CustomMappingRule, FieldMapping, FieldMappingConfiguration, FixedClock, MappedValue,
    PatientDemographics, RuleType, TransformContext, TransformationEngine,
};
use hl7_processor::{parse_message, ConfigError, TransformError};

fn adt(control_id: &str, family: &str) -> String {
    format!(
        "MSH|^~\\&|SND|SND|RCV|RCV|20230101120000||ADT^A01|{}|P|2.5\r\
         PID|1||{}-ID||{}^JOHN||19900615|m|||||(216) 555-1234\r",
        control_id, control_id, family
    )
}

fn demographics() -> FieldMappingConfiguration {
    FieldMappingConfiguration::new("demographics")
        .with_mapping(FieldMapping::new("PID-3", "patient_id").required())
        .with_mapping(FieldMapping::new("PID-5-1", "family_name"))
        .with_mapping(FieldMapping::new("PID-5-2", "given_name"))
        .with_mapping(FieldMapping::new("PID-7", "birth_date").data_type("date"))
        .with_mapping(FieldMapping::new("PID-8", "gender"))
        .with_mapping(FieldMapping::new("PID-13", "phone"))
}

#[test]
fn batch_keeps_index_alignment_past_a_malformed_message() {
    let engine = TransformationEngine::new(demographics()).unwrap();
    let mut batch: Vec<String> = (1..=10).map(|i| adt(&format!("M{}", i), "DOE")).collect();
    batch[4] = "\u{0}\u{1}ZZ|garbage^^^|\rPID|||||\r".to_string();

    let records = engine.transform_messages(&batch);
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        if i == 4 {
            assert!(record.is_empty());
        } else {
            assert_eq!(record.text("patient_id"), format!("M{}-ID", i + 1));
            assert_eq!(record.text("family_name"), "DOE");
        }
    }
    assert!(matches!(engine.transform_raw(&batch[4]), Err(TransformError::MalformedMessage(_))));
}

#[tokio::test]
async fn stream_matches_batch() {
    let engine = TransformationEngine::new(demographics()).unwrap();
    let inputs = vec![adt("S1", "ROE"), "junk".to_string(), adt("S3", "POE")];

    let streamed: Vec<_> = engine
        .transform_stream(futures::stream::iter(inputs.clone()))
        .collect()
        .await;
    assert_eq!(streamed, engine.transform_messages(&inputs));
    assert!(streamed[1].is_empty());
}

#[test]
fn calculate_age_uses_the_injected_clock() {
    let config = demographics().with_rule(
        CustomMappingRule::new("age", RuleType::BuiltIn, "calculate_age").applies_to(["birth_date"]),
    );
    let day_before_birthday = NaiveDate::from_ymd_opt(2024, 6, 14).unwrap();
    let engine = TransformationEngine::new(config.clone())
        .unwrap()
        .with_clock(Arc::new(FixedClock(day_before_birthday)));

    let record = engine.transform_message(&parse_message(&adt("A1", "DOE")));
    assert_eq!(record.get("age"), Some(&MappedValue::Integer(33)));

    let on_birthday = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
    let engine = TransformationEngine::new(config)
        .unwrap()
        .with_clock(Arc::new(FixedClock(on_birthday)));
    let record = engine.transform_message(&parse_message(&adt("A1", "DOE")));
    assert_eq!(record.get("age"), Some(&MappedValue::Integer(34)));
}

#[test]
fn duplicate_source_fields_fail_validation() {
    let config = demographics().with_mapping(FieldMapping::new("pid.5.1", "surname"));
    assert!(matches!(config.validate(), Err(ConfigError::DuplicateSourceField(_))));
    assert!(matches!(
        TransformationEngine::new(config),
        Err(ConfigError::DuplicateSourceField(_))
    ));
}

#[test]
fn missing_required_field_is_a_warning() {
    let config = demographics().with_mapping(FieldMapping::new("PV1-19", "visit_number").required());
    let engine = TransformationEngine::new(config).unwrap();

    let outcome = engine.transform(&parse_message(&adt("R1", "DOE")), &TransformContext::new());
    assert!(!outcome.record.contains_key("visit_number"));
    assert_eq!(outcome.record.text("family_name"), "DOE");
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("visit_number"));
}

#[test]
fn rules_run_in_priority_order_over_mapped_fields() {
    let config = demographics()
        .with_rule(CustomMappingRule::new("gender", RuleType::BuiltIn, "normalize_gender").priority(5))
        .with_rule(CustomMappingRule::new("phone", RuleType::BuiltIn, "format_phone").priority(5))
        .with_rule(
            CustomMappingRule::new(
                "label",
                RuleType::CalculatedField,
                "{given_name} + ' ' + {family_name} + ' (' + {gender} + ')'",
            )
            .target("label")
            .priority(1),
        )
        .with_rule(
            CustomMappingRule::new(
                "flag",
                RuleType::ConditionalMapping,
                "if family_name == 'DOE' then review = 'yes'",
            )
            .priority(0),
        );
    let engine = TransformationEngine::new(config).unwrap();
    let record = engine.transform_message(&parse_message(&adt("P1", "DOE")));

    assert_eq!(record.text("gender"), "Male");
    assert_eq!(record.text("phone"), "(216) 555-1234");
    assert_eq!(record.text("label"), "JOHN DOE (Male)");
    assert_eq!(record.text("review"), "yes");
}

#[test]
fn conditions_consult_context_before_the_message() {
    let config = FieldMappingConfiguration::new("conditional")
        .with_mapping(FieldMapping::new("PID-5-1", "family_name").when("MessageType", ConditionOperator::Equals, "ADT"))
        .with_mapping(FieldMapping::new("PID-5-2", "given_name").when("facility", ConditionOperator::Equals, "EAST"));
    let engine = TransformationEngine::new(config).unwrap();
    let message = parse_message(&adt("C1", "DOE"));

    let record = engine.transform(&message, &TransformContext::new()).record;
    assert_eq!(record.text("family_name"), "DOE");
    assert!(!record.contains_key("given_name"));

    let record = engine
        .transform(&message, &TransformContext::new().with("facility", "EAST"))
        .record;
    assert_eq!(record.text("given_name"), "JOHN");
}

#[test]
fn record_builds_typed_demographics() {
    let engine = TransformationEngine::new(demographics()).unwrap();
    let patient: PatientDemographics = engine
        .transform_message(&parse_message(&adt("B1", "DOE")))
        .build()
        .unwrap();
    assert_eq!(patient.patient_id, "B1-ID");
    assert_eq!(patient.family_name.as_deref(), Some("DOE"));
    assert_eq!(patient.birth_date, NaiveDate::from_ymd_opt(1990, 6, 15));
}
