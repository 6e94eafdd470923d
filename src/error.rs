use crate::formats::SectionId;

/// Structured data could not be recovered from a payload, even after repair and
/// exhaustive substring extraction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("no valid structure found")]
    NoValidStructure,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("decode failed: {0}")]
    Decode(#[from] ParseError),

    #[error("stream transport failed after {attempts} attempt(s): {reason}")]
    StreamTransport { attempts: u32, reason: String },

    #[error("generation already in progress for document {document_id}")]
    Busy { document_id: String },

    #[error("unknown section: {0}")]
    UnknownSection(SectionId),
}

/// Non-blocking findings. These are logged and auto-corrected, never returned as errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationWarning {
    #[error("section {id} level {level}: target words {from} corrected to {to}")]
    WordBudgetClamped {
        id: SectionId,
        level: usize,
        from: u64,
        to: u32,
    },

    #[error("body has no top-level heading")]
    MissingTopLevelHeading,

    #[error("body has {chars} visible characters, expected at least {min}")]
    BodyTooShort { chars: usize, min: usize },

    #[error("outline depth {depth} exceeds {max} for a document of this scale")]
    OutlineTooDeep { depth: usize, max: usize },

    #[error("dropped section with duplicate title: {title}")]
    DuplicateTitleDropped { title: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Warning {
    /// No usable heading split the body; the parent kept it whole.
    #[error("no usable heading under section {parent}; body kept whole")]
    StructuralAmbiguity { parent: SectionId },

    #[error(transparent)]
    Validation(#[from] ValidationWarning),
}
