use serde::{Deserialize, Serialize};
use std::fmt;

pub const NUM_CLASSES: usize = 4;

/// Stade de démence, dans l'ordre des indices de classe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClassLabel {
    #[serde(rename = "Non-Demented")]
    NonDemented,
    #[serde(rename = "Very Mild Demented")]
    VeryMildDemented,
    #[serde(rename = "Mild Demented")]
    MildDemented,
    #[serde(rename = "Moderate Demented")]
    ModerateDemented,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; NUM_CLASSES] = [
        ClassLabel::NonDemented,
        ClassLabel::VeryMildDemented,
        ClassLabel::MildDemented,
        ClassLabel::ModerateDemented,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            ClassLabel::NonDemented => "Non-Demented",
            ClassLabel::VeryMildDemented => "Very Mild Demented",
            ClassLabel::MildDemented => "Mild Demented",
            ClassLabel::ModerateDemented => "Moderate Demented",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
