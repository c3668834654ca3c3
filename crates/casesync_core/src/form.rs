//! Typed field registry for the case form.
//!
//! The form travels over the wire as a free-form key/value map. Locally the
//! well-known keys are modelled as [`FieldKey`] variants with a declared
//! [`FieldKind`], so reads go through typed accessors and writes are
//! validated before they leave the device. Keys the registry does not know
//! about are kept as [`FieldKey::Extension`] and accepted with any value,
//! which keeps older clients working when the form gains new fields.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value shape a well-known field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text.
    Text,
    /// Whole number.
    Integer,
    /// Number with a fractional part.
    Decimal,
    /// Yes/no flag.
    Flag,
    /// Anything (extension fields).
    Any,
}

impl FieldKind {
    /// Whether `value` fits this kind. `null` always fits (clears the field).
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldKind::Any, _) => true,
            (FieldKind::Text, Value::String(_)) => true,
            (FieldKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldKind::Decimal, Value::Number(_)) => true,
            (FieldKind::Flag, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Flag => "flag",
            FieldKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// Generates the registry: the enum, its wire names and declared kinds.
macro_rules! field_registry {
    ($($variant:ident => ($wire:literal, $kind:ident)),+ $(,)?) => {
        /// Key of a form field.
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum FieldKey {
            $(
                #[doc = concat!("`", $wire, "`")]
                $variant,
            )+
            /// A field the registry does not know about.
            Extension(String),
        }

        impl FieldKey {
            /// Every well-known key, in registry order.
            pub const KNOWN: &'static [FieldKey] = &[$(FieldKey::$variant),+];

            /// Wire name of the key.
            pub fn as_str(&self) -> &str {
                match self {
                    $(FieldKey::$variant => $wire,)+
                    FieldKey::Extension(name) => name,
                }
            }

            /// Declared kind of the key.
            pub fn kind(&self) -> FieldKind {
                match self {
                    $(FieldKey::$variant => FieldKind::$kind,)+
                    FieldKey::Extension(_) => FieldKind::Any,
                }
            }

            /// Resolve a wire name, falling back to an extension key.
            pub fn parse(name: &str) -> FieldKey {
                match name {
                    $($wire => FieldKey::$variant,)+
                    other => FieldKey::Extension(other.to_string()),
                }
            }
        }
    };
}

field_registry! {
    PatientName => ("patient_name", Text),
    PatientAge => ("patient_age", Integer),
    PatientGender => ("patient_gender", Text),
    ChiefComplaint => ("chief_complaint", Text),
    Diagnosis => ("diagnosis", Text),
    BloodPressure => ("blood_pressure", Text),
    HeartRate => ("heart_rate", Integer),
    RespiratoryRate => ("respiratory_rate", Integer),
    OxygenSaturation => ("oxygen_saturation", Integer),
    BodyTemperature => ("body_temperature", Decimal),
    BloodGlucose => ("blood_glucose", Integer),
    GlasgowComaScale => ("glasgow_coma_scale", Integer),
    ConsciousnessAlert => ("consciousness_alert", Flag),
    TreatmentNotes => ("treatment_notes", Text),
    TransportDestination => ("transport_destination", Text),
    VehiclePlate => ("vehicle_plate", Text),
    ConsentSigned => ("consent_signed", Flag),
}

impl FieldKey {
    /// Whether this key is part of the registry.
    pub fn is_known(&self) -> bool {
        !matches!(self, FieldKey::Extension(_))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for FieldKey {
    fn from(name: &str) -> Self {
        FieldKey::parse(name)
    }
}

impl From<String> for FieldKey {
    fn from(name: String) -> Self {
        FieldKey::parse(&name)
    }
}

impl Serialize for FieldKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(FieldKey::parse(&name))
    }
}

/// One field's value plus who changed it and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    /// Opaque value as sent by the server.
    pub value: Value,
    /// When the value last changed. Servers that do not track this send nothing.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// User id of the last writer, if known.
    #[serde(default)]
    pub updated_by: Option<String>,
}

impl FieldEntry {
    /// Entry with no change metadata.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            updated_at: None,
            updated_by: None,
        }
    }

    /// Set the change timestamp.
    pub fn at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Set the last writer.
    pub fn by(mut self, user_id: impl Into<String>) -> Self {
        self.updated_by = Some(user_id.into());
        self
    }
}

/// Local projection of the case form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormState {
    fields: IndexMap<FieldKey, FieldEntry>,
}

impl FormState {
    /// Empty form.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<FieldKey>, entry: FieldEntry) -> Self {
        self.fields.insert(key.into(), entry);
        self
    }

    /// Insert or replace a field.
    pub fn set(&mut self, key: FieldKey, entry: FieldEntry) {
        self.fields.insert(key, entry);
    }

    /// Raw entry for a field.
    pub fn entry(&self, key: &FieldKey) -> Option<&FieldEntry> {
        self.fields.get(key)
    }

    /// Raw value for a field.
    pub fn value(&self, key: &FieldKey) -> Option<&Value> {
        self.fields.get(key).map(|entry| &entry.value)
    }

    /// Text value, if the field holds a string.
    pub fn text(&self, key: &FieldKey) -> Option<&str> {
        self.value(key).and_then(Value::as_str)
    }

    /// Integer value, if the field holds a whole number.
    pub fn integer(&self, key: &FieldKey) -> Option<i64> {
        self.value(key).and_then(Value::as_i64)
    }

    /// Decimal value, if the field holds a number.
    pub fn decimal(&self, key: &FieldKey) -> Option<f64> {
        self.value(key).and_then(Value::as_f64)
    }

    /// Flag value, if the field holds a boolean.
    pub fn flag(&self, key: &FieldKey) -> Option<bool> {
        self.value(key).and_then(Value::as_bool)
    }

    /// Patient name.
    pub fn patient_name(&self) -> Option<&str> {
        self.text(&FieldKey::PatientName)
    }

    /// Patient age in years.
    pub fn patient_age(&self) -> Option<i64> {
        self.integer(&FieldKey::PatientAge)
    }

    /// Heart rate in beats per minute.
    pub fn heart_rate(&self) -> Option<i64> {
        self.integer(&FieldKey::HeartRate)
    }

    /// Oxygen saturation in percent.
    pub fn oxygen_saturation(&self) -> Option<i64> {
        self.integer(&FieldKey::OxygenSaturation)
    }

    /// Body temperature in degrees Celsius.
    pub fn body_temperature(&self) -> Option<f64> {
        self.decimal(&FieldKey::BodyTemperature)
    }

    /// Whether the consent form has been signed.
    pub fn consent_signed(&self) -> Option<bool> {
        self.flag(&FieldKey::ConsentSigned)
    }

    /// Fields that are not part of the registry.
    pub fn extensions(&self) -> impl Iterator<Item = (&str, &FieldEntry)> {
        self.fields
            .iter()
            .filter(|(key, _)| !key.is_known())
            .map(|(key, entry)| (key.as_str(), entry))
    }

    /// All fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &FieldEntry)> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the form has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Check a value against the registry before it is written.
pub fn validate(key: &FieldKey, value: &Value) -> Result<(), FieldKind> {
    let kind = key.kind();
    if kind.accepts(value) {
        Ok(())
    } else {
        Err(kind)
    }
}
