//! Declarative field mapping from parsed messages into flat typed records.

pub mod config;
pub mod engine;
pub mod expression;
pub mod functions;
pub mod path;
pub mod rules;
pub mod value;

pub use config::{
    ConditionOperator, CustomMappingRule, FieldMapping, FieldMappingConfiguration, MappingCondition, RuleType,
    ValidationKind, ValidationRule,
};
pub use engine::{TransformOutcome, TransformationEngine};
pub use path::{FieldPath, SourceField, VirtualField};
pub use rules::{Clock, FixedClock, SystemClock, TransformContext};
pub use value::{FromRecord, MappedRecord, MappedValue, PatientDemographics};
