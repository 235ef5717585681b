//! On-disk layout of an account root.
//!
//! ```text
//! <root>/.mau/account.json          sealed account key, name, email
//! <root>/.mau/<fp>.mau              friend identities
//! <root>/.mau/following/<fp>        follow markers
//! <root>/<own fp>/<name>.mau        published files
//! <root>/<friend fp>/<name>.mau     files downloaded from a friend
//! ```

use std::path::{Path, PathBuf};

use crate::fingerprint::Fingerprint;

/// Extension carried by every encrypted file and friend identity.
pub const ENCRYPTED_SUFFIX: &str = ".mau";

const CONFIG_DIR: &str = ".mau";
const ACCOUNT_FILE: &str = "account.json";
const FOLLOWING_DIR: &str = "following";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn account_file(&self) -> PathBuf {
        self.config_dir().join(ACCOUNT_FILE)
    }

    pub fn friend_file(&self, fp: &Fingerprint) -> PathBuf {
        self.config_dir().join(format!("{fp}{ENCRYPTED_SUFFIX}"))
    }

    pub fn following_dir(&self) -> PathBuf {
        self.config_dir().join(FOLLOWING_DIR)
    }

    pub fn follow_marker(&self, fp: &Fingerprint) -> PathBuf {
        self.following_dir().join(fp.to_string())
    }

    /// Directory holding the files owned by `fp`: published files for the
    /// account itself, downloads for a friend.
    pub fn files_dir(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(fp.to_string())
    }

    /// Path of the encrypted file `name` inside `fp`'s directory. `name` must
    /// already be sanitised.
    pub fn file_path(&self, fp: &Fingerprint, name: &str) -> PathBuf {
        self.files_dir(fp).join(format!("{name}{ENCRYPTED_SUFFIX}"))
    }
}

/// Strips [`ENCRYPTED_SUFFIX`] from a stored file name.
pub fn plain_name(stored: &str) -> Option<&str> {
    stored
        .strip_suffix(ENCRYPTED_SUFFIX)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn given_fingerprint_when_building_paths_then_follow_layout() {
        let fp = Fingerprint::of(&SigningKey::generate(&mut OsRng).verifying_key());
        let layout = Layout::new("/data");
        assert_eq!(layout.account_file(), Path::new("/data/.mau/account.json"));
        assert_eq!(layout.friend_file(&fp), PathBuf::from(format!("/data/.mau/{fp}.mau")));
        assert_eq!(layout.follow_marker(&fp), PathBuf::from(format!("/data/.mau/following/{fp}")));
        assert_eq!(
            layout.file_path(&fp, "hello.txt"),
            PathBuf::from(format!("/data/{fp}/hello.txt.mau"))
        );
    }

    #[test]
    fn when_stripping_suffix_expect_plain_name_only_for_encrypted_files() {
        assert_eq!(plain_name("hello.txt.mau"), Some("hello.txt"));
        assert_eq!(plain_name("hello.txt"), None);
        assert_eq!(plain_name(".mau"), None);
    }
}
