use serde::{Serialize, Serializer};
use std::fmt;

/// Number of classes the network head produces.
pub const CLASS_COUNT: usize = 8;

/// Coarse risk category attached to every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Benign,
    Malignant,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Benign => "Benigno",
            Category::Malignant => "Maligno",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Lesion classes in the order of the network's output units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassLabel {
    Nevus,
    Melanoma,
    BasalCellCarcinoma,
    ActinicKeratosis,
    BenignKeratosis,
    Dermatofibroma,
    VascularLesion,
    SquamousCellCarcinoma,
}

struct ClassEntry {
    label: ClassLabel,
    name: &'static str,
    category: Category,
}

// Row i describes output unit i.
const CLASS_TABLE: [ClassEntry; CLASS_COUNT] = [
    ClassEntry {
        label: ClassLabel::Nevus,
        name: "Nevus (Benigno)",
        category: Category::Benign,
    },
    ClassEntry {
        label: ClassLabel::Melanoma,
        name: "Melanoma (Maligno)",
        category: Category::Malignant,
    },
    ClassEntry {
        label: ClassLabel::BasalCellCarcinoma,
        name: "Carcinoma basocelular (Maligno)",
        category: Category::Malignant,
    },
    ClassEntry {
        label: ClassLabel::ActinicKeratosis,
        name: "Queratosis actínica (Maligno)",
        category: Category::Malignant,
    },
    ClassEntry {
        label: ClassLabel::BenignKeratosis,
        name: "Queratosis benigna (Benigno)",
        category: Category::Benign,
    },
    ClassEntry {
        label: ClassLabel::Dermatofibroma,
        name: "Dermatofibroma (Benigno)",
        category: Category::Benign,
    },
    ClassEntry {
        label: ClassLabel::VascularLesion,
        name: "Lesión vascular (Benigno)",
        category: Category::Benign,
    },
    ClassEntry {
        label: ClassLabel::SquamousCellCarcinoma,
        name: "Carcinoma de células escamosas (Maligno)",
        category: Category::Malignant,
    },
];

impl ClassLabel {
    /// All labels in declared (output unit) order.
    pub const ALL: [ClassLabel; CLASS_COUNT] = [
        ClassLabel::Nevus,
        ClassLabel::Melanoma,
        ClassLabel::BasalCellCarcinoma,
        ClassLabel::ActinicKeratosis,
        ClassLabel::BenignKeratosis,
        ClassLabel::Dermatofibroma,
        ClassLabel::VascularLesion,
        ClassLabel::SquamousCellCarcinoma,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Label for output unit `index`.
    pub fn from_index(index: usize) -> Option<Self> {
        CLASS_TABLE.get(index).map(|entry| entry.label)
    }

    /// Name used on the wire and as the probabilities map key.
    pub fn as_str(&self) -> &'static str {
        CLASS_TABLE[self.index()].name
    }

    pub fn category(&self) -> Category {
        CLASS_TABLE[self.index()].category
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ClassLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
