//! Error types for the transform pipeline
//!
//! Every error carries a bracketed code so log lines and API payloads can be
//! grouped without string matching on the human text.
//!
//! # Error Codes
//!
//! Error codes follow the pattern: `E<category><number>`
//!
//! Categories:
//! - **E1xxx**: I/O and archive errors
//! - **E2xxx**: XML / JSON structure errors
//! - **E3xxx**: Geometry resolution errors
//! - **E4xxx**: Validation failures (caller-actionable)
//! - **E5xxx**: Profile merge errors
//! - **E6xxx**: External slicer failures
//! - **E7xxx**: Rendering errors
//!
//! Attribute-level data problems (for example a transform string with the wrong
//! token count) are not errors at all: they degrade to a neutral value and are
//! logged as warnings.

use std::io;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the transform pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred while reading or writing a file
    ///
    /// **Error Code**: E1001
    #[error("[E1001] I/O error: {0}")]
    Io(#[from] io::Error),

    /// ZIP error raised while reading or writing an archive that was already opened
    ///
    /// **Error Code**: E1002
    #[error("[E1002] ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The input is not a readable ZIP container
    ///
    /// **Error Code**: E1003
    ///
    /// **Common Causes**:
    /// - Upload truncated in transit
    /// - A plain STL or G-code file renamed to `.3mf`
    #[error("[E1003] Invalid 3MF file: not a valid ZIP archive ({0})")]
    CorruptArchive(String),

    /// The archive has no `3D/3dmodel.model` member
    ///
    /// **Error Code**: E1004
    #[error("[E1004] Invalid 3MF file: missing 3D/3dmodel.model")]
    MissingModel,

    /// A member referenced by the model (for example a `p:path` sub-model) is absent
    ///
    /// **Error Code**: E1005
    #[error("[E1005] Missing archive member: {0}")]
    MissingFile(String),

    /// The model XML could not be parsed
    ///
    /// **Error Code**: E2001
    #[error("[E2001] Invalid 3MF file: malformed XML ({0})")]
    MalformedModel(String),

    /// Low-level XML reader error
    ///
    /// **Error Code**: E2002
    #[error("[E2002] XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// XML attribute error
    ///
    /// **Error Code**: E2003
    #[error("[E2003] XML attribute error: {0}")]
    XmlAttr(String),

    /// XML writing error
    ///
    /// **Error Code**: E2004
    #[error("[E2004] XML writing error: {0}")]
    XmlWrite(String),

    /// JSON (settings document or profile) error
    ///
    /// **Error Code**: E2005
    #[error("[E2005] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The model XML has no `<build>` section
    ///
    /// **Error Code**: E2006
    #[error("[E2006] 3MF missing build section")]
    MissingBuild,

    /// Component references nest deeper than the configured limit
    ///
    /// **Error Code**: E3001
    ///
    /// **Common Causes**:
    /// - Circular component references
    /// - Pathologically nested assemblies
    #[error("[E3001] 3MF component nesting too deep (limit {limit})")]
    GeometryTooDeep {
        /// The depth ceiling that was exceeded
        limit: usize,
    },

    /// Numeric parse error
    ///
    /// **Error Code**: E3002
    #[error("[E3002] Parse error: {0}")]
    ParseError(String),

    /// A build-item index is outside `[1, item_count]`
    ///
    /// **Error Code**: E4001
    #[error("[E4001] {0}")]
    InvalidIndex(String),

    /// The same build-item index appears twice in one request
    ///
    /// **Error Code**: E4002
    #[error("[E4002] Duplicate build_item_index in object_transforms: {0}")]
    DuplicateIndex(usize),

    /// A caller-supplied object id does not match the build item it targets
    ///
    /// **Error Code**: E4003
    ///
    /// **Common Causes**:
    /// - The client cached a layout from an older revision of the file
    #[error("[E4003] build_item_index {index} object_id mismatch (expected {expected}, got {actual})")]
    ObjectIdMismatch {
        /// 1-based build item index
        index: usize,
        /// Object id the caller expected
        expected: String,
        /// Object id found in the archive
        actual: String,
    },

    /// A plate id is outside the plates present in the file
    ///
    /// **Error Code**: E4004
    #[error("[E4004] {0}")]
    PlateNotFound(String),

    /// A mutated layout no longer fits the build volume
    ///
    /// **Error Code**: E4005
    #[error("[E4005] {0}")]
    OutOfBuildVolume(String),

    /// A request is structurally unusable (empty transform list, bad percentages)
    ///
    /// **Error Code**: E4006
    #[error("[E4006] {0}")]
    InvalidRequest(String),

    /// Multi-filament output only ever selected tool 0
    ///
    /// **Error Code**: E4007
    #[error("[E4007] {0}")]
    MulticolorDegenerate(String),

    /// Profile loading or merging failed
    ///
    /// **Error Code**: E5001
    #[error("[E5001] Profile embedding failed: {0}")]
    Profile(String),

    /// The external slicer failed
    ///
    /// **Error Code**: E6001
    #[error("[E6001] Slicer failed: {0}")]
    Slicer(String),

    /// Image encoding error
    ///
    /// **Error Code**: E7001
    #[error("[E7001] Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<std::num::ParseFloatError> for Error {
    fn from(err: std::num::ParseFloatError) -> Self {
        Error::ParseError(format!("Failed to parse floating-point number: {}", err))
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::ParseError(format!("Failed to parse integer: {}", err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::XmlAttr(format!("Attribute parsing failed: {}", err))
    }
}

impl Error {
    /// Short machine-readable kind, stable across releases
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Zip(_) => "zip",
            Error::CorruptArchive(_) => "corrupt_archive",
            Error::MissingModel => "missing_model",
            Error::MissingFile(_) => "missing_file",
            Error::MalformedModel(_) | Error::Xml(_) | Error::XmlAttr(_) => "malformed_model",
            Error::XmlWrite(_) => "xml_write",
            Error::Json(_) => "json",
            Error::MissingBuild => "missing_build",
            Error::GeometryTooDeep { .. } => "geometry_too_deep",
            Error::ParseError(_) => "parse_error",
            Error::InvalidIndex(_) => "invalid_index",
            Error::DuplicateIndex(_) => "duplicate_index",
            Error::ObjectIdMismatch { .. } => "object_id_mismatch",
            Error::PlateNotFound(_) => "plate_not_found",
            Error::OutOfBuildVolume(_) => "out_of_build_volume",
            Error::InvalidRequest(_) => "invalid_request",
            Error::MulticolorDegenerate(_) => "multicolor_degenerate",
            Error::Profile(_) => "profile",
            Error::Slicer(_) => "slicer",
            Error::Image(_) => "image",
        }
    }

    /// Whether the failure is actionable by the caller
    ///
    /// Host APIs map these to a client-error status. Everything else is an
    /// internal or external-process failure.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::CorruptArchive(_)
                | Error::MissingModel
                | Error::MalformedModel(_)
                | Error::MissingBuild
                | Error::InvalidIndex(_)
                | Error::DuplicateIndex(_)
                | Error::ObjectIdMismatch { .. }
                | Error::PlateNotFound(_)
                | Error::OutOfBuildVolume(_)
                | Error::InvalidRequest(_)
                | Error::MulticolorDegenerate(_)
        )
    }

    /// Create a MalformedModel error naming the archive member
    pub fn malformed(member: &str, message: impl std::fmt::Display) -> Self {
        Error::MalformedModel(format!("{}: {}", member, message))
    }

    /// Create a Slicer error, truncating diagnostic text to `limit` characters
    pub fn slicer_output(stderr: &str, limit: usize) -> Self {
        Error::Slicer(stderr.chars().take(limit).collect())
    }

    /// Create an XmlWrite error
    pub fn xml_write(message: String) -> Self {
        Error::XmlWrite(message)
    }
}
