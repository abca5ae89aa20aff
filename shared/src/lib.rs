use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// Output classes of the fusion classifier, in logit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiagnosisLabel {
    Healthy,
    Pneumonia,
}

impl DiagnosisLabel {
    pub fn index(self) -> usize {
        match self {
            DiagnosisLabel::Healthy => 0,
            DiagnosisLabel::Pneumonia => 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResponse {
    pub healthy: f64,
    pub pneumonia: f64,
    pub status: String,
}

impl PredictionResponse {
    pub fn success(healthy: f64, pneumonia: f64) -> Self {
        Self {
            healthy,
            pneumonia,
            status: "success".to_string(),
        }
    }

    pub fn most_likely(&self) -> DiagnosisLabel {
        if self.pneumonia > self.healthy {
            DiagnosisLabel::Pneumonia
        } else {
            DiagnosisLabel::Healthy
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}
