//! Boot media materialization.
//!
//! Guarantees an installer ISO and an automated-install answer ISO are
//! present on a storage pool before VM creation:
//! - `mirror`: latest-installer discovery against the public mirror
//! - `answer`: answer document rendering and subprocess ISO authoring
//! - `resolver`: idempotent ensure-or-download-or-reuse orchestration

mod answer;
mod mirror;
mod resolver;

pub use answer::{
    AnswerImageAuthoring, AnswerSettings, IsoToolAuthoring, UnavailableAuthoring,
    ANSWER_ISO_FILENAME, ANSWER_VOLUME_LABEL,
};
pub use mirror::{InstallerImage, DEFAULT_MIRROR_URL};
pub use resolver::{MediaAsset, MediaKind, MediaResolver};
