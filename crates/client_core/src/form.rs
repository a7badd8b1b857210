use shared::domain::{ClassLabel, Feature, PhotometricInput};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing required parameters: {}", feature_list(.0))]
pub struct MissingFields(pub Vec<Feature>);

fn feature_list(features: &[Feature]) -> String {
    features
        .iter()
        .map(|feature| feature.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The six-field parameter form. Every field is required; ranges are only
/// slider hints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterForm {
    values: [Option<f64>; Feature::ALL.len()],
}

fn slot(feature: Feature) -> usize {
    match feature {
        Feature::U => 0,
        Feature::G => 1,
        Feature::R => 2,
        Feature::I => 3,
        Feature::Z => 4,
        Feature::Redshift => 5,
    }
}

impl ParameterForm {
    pub fn from_input(input: PhotometricInput) -> Self {
        let mut form = Self::default();
        for feature in Feature::ALL {
            form.set(feature, input.get(feature));
        }
        form
    }

    pub fn get(&self, feature: Feature) -> Option<f64> {
        self.values[slot(feature)]
    }

    pub fn set(&mut self, feature: Feature, value: f64) {
        self.values[slot(feature)] = Some(value);
    }

    pub fn clear(&mut self, feature: Feature) {
        self.values[slot(feature)] = None;
    }

    /// Fills every field with the example object for `class`.
    pub fn load_preset(&mut self, class: ClassLabel) -> bool {
        match PhotometricInput::example(class) {
            Some(example) => {
                *self = Self::from_input(example);
                true
            }
            None => false,
        }
    }

    pub fn missing(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|feature| self.get(*feature).is_none())
            .collect()
    }

    pub fn to_input(&self) -> Result<PhotometricInput, MissingFields> {
        match self.values {
            [Some(u), Some(g), Some(r), Some(i), Some(z), Some(redshift)] => Ok(PhotometricInput {
                u,
                g,
                r,
                i,
                z,
                redshift,
            }),
            _ => Err(MissingFields(self.missing())),
        }
    }
}
