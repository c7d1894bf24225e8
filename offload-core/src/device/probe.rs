use std::fmt;
use std::io;
use std::path::PathBuf;

/// One mounted removable volume as the platform reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Mount point of the volume.
    pub root: PathBuf,
    /// Human-readable volume label; may be empty.
    pub label: String,
    /// Hardware serial as reported by the platform; untrimmed.
    pub serial: String,
}

/// Platform seam: enumerate mounted removable volumes with their hardware
/// serials. The production implementation lives with the host application;
/// the engine only needs the pure query.
pub trait VolumeProbe: Send + Sync {
    fn volumes(&self) -> io::Result<Vec<VolumeInfo>>;
}

impl fmt::Debug for dyn VolumeProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VolumeProbe")
    }
}
