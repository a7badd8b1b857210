use std::{borrow::Borrow, collections::BTreeMap, fmt, str::FromStr};

use serde::{
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }
    };
}

id_newtype!(RequestSeq);
id_newtype!(ExplanationGeneration);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown class label '{0}'")]
pub struct UnknownClassLabel(pub String);

/// Object class predicted by a model. `Error` marks a model that failed for
/// this submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassLabel {
    Star,
    Galaxy,
    Qso,
    Error,
}

impl ClassLabel {
    /// Real classes, in vote tie-break priority order.
    pub const CLASSES: [ClassLabel; 3] = [ClassLabel::Star, ClassLabel::Galaxy, ClassLabel::Qso];

    pub fn as_str(self) -> &'static str {
        match self {
            ClassLabel::Star => "STAR",
            ClassLabel::Galaxy => "GALAXY",
            ClassLabel::Qso => "QSO",
            ClassLabel::Error => "Error",
        }
    }

    pub fn is_error(self) -> bool {
        self == ClassLabel::Error
    }

    pub fn class_index(self) -> Option<usize> {
        Self::CLASSES.iter().position(|class| *class == self)
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassLabel {
    type Err = UnknownClassLabel;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STAR" => Ok(ClassLabel::Star),
            "GALAXY" => Ok(ClassLabel::Galaxy),
            "QSO" => Ok(ClassLabel::Qso),
            "ERROR" => Ok(ClassLabel::Error),
            _ => Err(UnknownClassLabel(raw.to_string())),
        }
    }
}

impl Serialize for ClassLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ClassLabel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Short key naming one classifier of the ensemble (`rf`, `svm`, `knn`, `mlp`, `dl`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub String);

impl ModelId {
    pub const RANDOM_FOREST: &'static str = "rf";
    pub const SVM: &'static str = "svm";
    pub const KNN: &'static str = "knn";
    pub const MLP: &'static str = "mlp";
    pub const DEEP_LEARNING: &'static str = "dl";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_deep_learning(&self) -> bool {
        self.0 == Self::DEEP_LEARNING
    }

    pub fn display_name(&self) -> &str {
        match self.0.as_str() {
            Self::RANDOM_FOREST => "Random Forest",
            Self::SVM => "Support Vector Machine",
            Self::KNN => "K-Nearest Neighbours",
            Self::MLP => "Multi-Layer Perceptron",
            Self::DEEP_LEARNING => "Deep Learning",
            other => other,
        }
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for ModelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Class probability distribution of one model, in the order the service sent it.
///
/// The service reports a failed model as `{"Error": "<reason>"}`; that reason is
/// kept in [`ClassProbabilities::failure`] rather than rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassProbabilities {
    entries: Vec<(ClassLabel, f64)>,
    failure: Option<String>,
}

impl ClassProbabilities {
    pub fn new(entries: impl IntoIterator<Item = (ClassLabel, f64)>) -> Self {
        let mut probabilities = Self::default();
        for (label, probability) in entries {
            probabilities.insert(label, probability);
        }
        probabilities
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            failure: Some(reason.into()),
        }
    }

    /// Replaces the value of an existing label in place, otherwise appends.
    pub fn insert(&mut self, label: ClassLabel, probability: f64) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == label) {
            Some(slot) => slot.1 = probability,
            None => self.entries.push((label, probability)),
        }
    }

    pub fn get(&self, label: ClassLabel) -> Option<f64> {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == label)
            .map(|(_, probability)| *probability)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassLabel, f64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

impl Serialize for ClassProbabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.failure.is_some());
        let mut map = serializer.serialize_map(Some(self.entries.len() + extra))?;
        for (label, probability) in &self.entries {
            map.serialize_entry(label.as_str(), probability)?;
        }
        if let Some(reason) = &self.failure {
            map.serialize_entry(ClassLabel::Error.as_str(), reason)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ClassProbabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProbabilitiesVisitor;

        impl<'de> Visitor<'de> for ProbabilitiesVisitor {
            type Value = ClassProbabilities;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of class label to probability")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut probabilities = ClassProbabilities::default();
                while let Some(key) = map.next_key::<String>()? {
                    let label: ClassLabel = key.parse().map_err(de::Error::custom)?;
                    if label.is_error() {
                        let reason = match map.next_value::<serde_json::Value>()? {
                            serde_json::Value::String(reason) => reason,
                            other => other.to_string(),
                        };
                        probabilities.failure = Some(reason);
                        continue;
                    }
                    let probability: f64 = map.next_value()?;
                    probabilities.insert(label, probability);
                }
                Ok(probabilities)
            }
        }

        deserializer.deserialize_map(ProbabilitiesVisitor)
    }
}

/// One model's output for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEntry {
    #[serde(rename = "prediction")]
    pub label: ClassLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub probabilities: ClassProbabilities,
}

impl PredictionEntry {
    pub fn new(label: ClassLabel, confidence: Option<f64>, probabilities: ClassProbabilities) -> Self {
        Self {
            label,
            confidence,
            probabilities,
        }
    }

    /// Hard label only, as returned by models without `predict_proba`.
    pub fn label_only(label: ClassLabel) -> Self {
        Self::new(label, None, ClassProbabilities::default())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(ClassLabel::Error, None, ClassProbabilities::failed(reason))
    }

    pub fn is_error(&self) -> bool {
        self.label.is_error()
    }
}

pub type ModelPredictionSet = BTreeMap<ModelId, PredictionEntry>;

/// Plurality vote across models. `prediction == None` reads as "Unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub prediction: Option<ClassLabel>,
    pub count: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ConsensusResult {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.prediction.is_none()
    }

    pub fn label(&self) -> &'static str {
        self.prediction.map_or("Unknown", ClassLabel::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    U,
    G,
    R,
    I,
    Z,
    Redshift,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::U,
        Feature::G,
        Feature::R,
        Feature::I,
        Feature::Z,
        Feature::Redshift,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Feature::U => "u",
            Feature::G => "g",
            Feature::R => "r",
            Feature::I => "i",
            Feature::Z => "z",
            Feature::Redshift => "redshift",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Feature::U => "u (UV)",
            Feature::G => "g (Green)",
            Feature::R => "r (Red)",
            Feature::I => "i (IR)",
            Feature::Z => "z (Far IR)",
            Feature::Redshift => "Redshift",
        }
    }

    /// Slider range for the input widget. Not enforced on submission.
    pub fn range(self) -> FeatureRange {
        match self {
            Feature::Redshift => FeatureRange {
                min: -0.5,
                max: 5.0,
                step: 0.01,
            },
            _ => FeatureRange {
                min: 10.0,
                max: 30.0,
                step: 0.1,
            },
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature '{0}' (expected one of u, g, r, i, z, redshift)")]
pub struct UnknownFeature(pub String);

impl FromStr for Feature {
    type Err = UnknownFeature;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lowered = raw.trim().to_ascii_lowercase();
        Feature::ALL
            .into_iter()
            .find(|feature| feature.name() == lowered)
            .ok_or_else(|| UnknownFeature(raw.to_string()))
    }
}

/// The six photometric parameters sent to `/predict`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotometricInput {
    pub u: f64,
    pub g: f64,
    pub r: f64,
    pub i: f64,
    pub z: f64,
    pub redshift: f64,
}

impl PhotometricInput {
    pub fn get(&self, feature: Feature) -> f64 {
        match feature {
            Feature::U => self.u,
            Feature::G => self.g,
            Feature::R => self.r,
            Feature::I => self.i,
            Feature::Z => self.z,
            Feature::Redshift => self.redshift,
        }
    }

    /// Representative catalogue objects for each real class.
    pub fn example(class: ClassLabel) -> Option<Self> {
        match class {
            ClassLabel::Star => Some(Self {
                u: 18.85,
                g: 17.63,
                r: 16.90,
                i: 16.60,
                z: 16.39,
                redshift: -0.000089,
            }),
            ClassLabel::Galaxy => Some(Self {
                u: 19.47,
                g: 17.91,
                r: 17.02,
                i: 16.63,
                z: 16.37,
                redshift: 0.080111,
            }),
            ClassLabel::Qso => Some(Self {
                u: 19.29,
                g: 19.24,
                r: 19.06,
                i: 18.96,
                z: 18.89,
                redshift: 1.854089,
            }),
            ClassLabel::Error => None,
        }
    }
}
