use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::time::UtcTime;

/// Stable identity of a volume, persisted in the volume's `volume-id` file.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new<S: Into<String>>(s: S) -> Self { Self(s.into()) }

    /// 16 lowercase hex chars taken from a random v4 UUID.
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..16].to_string())
    }

    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        assert!(!self.0.is_empty(), "VolumeId is empty");
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverKey {
    pub project_id: ProjectId,
    pub receiver_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportKey {
    #[serde(flatten)]
    pub receiver: ReceiverKey,
    pub export_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileKey {
    #[serde(flatten)]
    pub export: ExportKey,
    #[serde(rename = "fileOpenedAt")]
    pub opened_at: UtcTime,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceKey {
    #[serde(flatten)]
    pub file: FileKey,
    pub volume_id: VolumeId,
    #[serde(rename = "sliceOpenedAt")]
    pub opened_at: UtcTime,
}

impl ReceiverKey {
    pub fn new<S: Into<String>>(project_id: u64, receiver_id: S) -> Self {
        Self { project_id: ProjectId(project_id), receiver_id: receiver_id.into() }
    }
}

impl ExportKey {
    pub fn new<S: Into<String>>(receiver: ReceiverKey, export_id: S) -> Self { Self { receiver, export_id: export_id.into() } }
    pub fn project_id(&self) -> ProjectId { self.receiver.project_id }
}

impl FileKey {
    pub fn new(export: ExportKey, opened_at: UtcTime) -> Self { Self { export, opened_at } }
}

impl SliceKey {
    pub fn new(file: FileKey, volume_id: VolumeId, opened_at: UtcTime) -> Self { Self { file, volume_id, opened_at } }

    pub fn export(&self) -> &ExportKey { &self.file.export }

    /// Slice directory relative to the volume root.
    pub fn local_dir(&self) -> PathBuf {
        let export = &self.file.export;
        PathBuf::from(export.receiver.project_id.to_string())
            .join(&export.receiver.receiver_id)
            .join(&export.export_id)
            .join(non_zero(&self.file.opened_at, "file").dir_name())
            .join(non_zero(&self.opened_at, "slice").dir_name())
    }
}

fn non_zero<'a>(t: &'a UtcTime, what: &str) -> &'a UtcTime {
    assert!(!t.is_zero(), "{} opened at time is not set", what);
    t
}

impl Display for ReceiverKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}/{}", self.project_id, self.receiver_id) }
}

impl Display for ExportKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}/{}", self.receiver, self.export_id) }
}

impl Display for FileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.export, non_zero(&self.opened_at, "file"))
    }
}

impl Display for SliceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.file, self.volume_id, non_zero(&self.opened_at, "slice"))
    }
}

/// Any object statistics can be aggregated for.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKey {
    Project(ProjectId),
    Receiver(ReceiverKey),
    Export(ExportKey),
    File(FileKey),
    Slice(SliceKey),
}

impl ObjectKey {
    pub fn parent(&self) -> Option<ObjectKey> {
        match self {
            ObjectKey::Project(_) => None,
            ObjectKey::Receiver(k) => Some(ObjectKey::Project(k.project_id)),
            ObjectKey::Export(k) => Some(ObjectKey::Receiver(k.receiver.clone())),
            ObjectKey::File(k) => Some(ObjectKey::Export(k.export.clone())),
            ObjectKey::Slice(k) => Some(ObjectKey::File(k.file.clone())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ObjectKey::Project(_) => "project",
            ObjectKey::Receiver(_) => "receiver",
            ObjectKey::Export(_) => "export",
            ObjectKey::File(_) => "file",
            ObjectKey::Slice(_) => "slice",
        }
    }

    pub fn export(&self) -> Option<&ExportKey> {
        match self {
            ObjectKey::Export(k) => Some(k),
            ObjectKey::File(k) => Some(&k.export),
            ObjectKey::Slice(k) => Some(&k.file.export),
            _ => None,
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKey::Project(k) => k.fmt(f),
            ObjectKey::Receiver(k) => k.fmt(f),
            ObjectKey::Export(k) => k.fmt(f),
            ObjectKey::File(k) => k.fmt(f),
            ObjectKey::Slice(k) => k.fmt(f),
        }
    }
}

impl From<ProjectId> for ObjectKey { fn from(k: ProjectId) -> Self { ObjectKey::Project(k) } }
impl From<ReceiverKey> for ObjectKey { fn from(k: ReceiverKey) -> Self { ObjectKey::Receiver(k) } }
impl From<ExportKey> for ObjectKey { fn from(k: ExportKey) -> Self { ObjectKey::Export(k) } }
impl From<FileKey> for ObjectKey { fn from(k: FileKey) -> Self { ObjectKey::File(k) } }
impl From<SliceKey> for ObjectKey { fn from(k: SliceKey) -> Self { ObjectKey::Slice(k) } }

#[cfg(test)]
pub(crate) fn test_slice_key() -> SliceKey {
    let export = ExportKey::new(ReceiverKey::new(123, "my-receiver"), "my-export");
    let file = FileKey::new(export, "2000-01-01T01:00:00.000Z".parse().unwrap());
    SliceKey::new(file, VolumeId::new("my-volume"), "2000-01-01T02:00:00.000Z".parse().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_strings() {
        let k = test_slice_key();
        assert_eq!(k.file.export.receiver.to_string(), "123/my-receiver");
        assert_eq!(k.file.to_string(), "123/my-receiver/my-export/2000-01-01T01:00:00.000Z");
        assert_eq!(k.to_string(), "123/my-receiver/my-export/2000-01-01T01:00:00.000Z/my-volume/2000-01-01T02:00:00.000Z");
        assert_eq!(
            k.local_dir(),
            PathBuf::from("123/my-receiver/my-export/2000-01-01T01-00-00.000Z/2000-01-01T02-00-00.000Z")
        );
    }

    #[test]
    fn object_parents() {
        let k: ObjectKey = test_slice_key().into();
        let chain: Vec<&str> = std::iter::successors(Some(k), |k| k.parent()).map(|k| k.kind()).collect();
        assert_eq!(chain, vec!["slice", "file", "export", "receiver", "project"]);
    }

    #[test]
    fn generated_volume_id() {
        let id = VolumeId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, VolumeId::generate());
    }

    #[test]
    #[should_panic(expected = "VolumeId is empty")]
    fn empty_volume_id_panics() {
        let _ = VolumeId::default().to_string();
    }

    #[test]
    #[should_panic(expected = "opened at time is not set")]
    fn unset_opened_at_panics() {
        let mut k = test_slice_key();
        k.opened_at = UtcTime::default();
        let _ = k.to_string();
    }

    #[test]
    fn slice_key_json() {
        let json = serde_json::to_value(test_slice_key()).unwrap();
        assert_eq!(json["projectId"], 123);
        assert_eq!(json["receiverId"], "my-receiver");
        assert_eq!(json["exportId"], "my-export");
        assert_eq!(json["fileOpenedAt"], "2000-01-01T01:00:00.000Z");
        assert_eq!(json["volumeId"], "my-volume");
        assert_eq!(json["sliceOpenedAt"], "2000-01-01T02:00:00.000Z");
    }
}
