use crate::auth::{
    CodeIdentity, CodeIdentitySource, PeerCredentials, SignerEntry, SigningInfo, SigningManifest,
};
use crate::error::SecurityError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const BUFFER_SIZE: usize = 64 * 1024;

/// Code identity derived from `/proc/<pid>/exe` and checked against a
/// signing manifest.
///
/// The digest is taken through the `/proc` link, so it covers the image the
/// process actually runs even if the path on disk has since been replaced.
pub struct ProcCodeIdentitySource {
    proc_root: PathBuf,
    manifest: SigningManifest,
}

impl ProcCodeIdentitySource {
    pub fn new(manifest: SigningManifest) -> Self {
        Self::with_proc_root("/proc", manifest)
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>, manifest: SigningManifest) -> Self {
        Self {
            proc_root: proc_root.into(),
            manifest,
        }
    }

    fn entry(&self, identity: &CodeIdentity) -> Result<&SignerEntry, SecurityError> {
        self.manifest.entry_for(&identity.executable).ok_or_else(|| {
            SecurityError::InvalidSignature(format!(
                "{} is not a known signed executable",
                identity.executable.display()
            ))
        })
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl CodeIdentitySource for ProcCodeIdentitySource {
    fn code_identity(&self, peer: &PeerCredentials) -> Result<CodeIdentity, SecurityError> {
        let pid = peer.pid.ok_or_else(|| {
            SecurityError::CredentialsUnavailable("peer process id is unknown".into())
        })?;
        let exe = self.proc_root.join(pid.to_string()).join("exe");

        let executable = std::fs::read_link(&exe)
            .map_err(|e| SecurityError::InvalidSignature(format!("{}: {e}", exe.display())))?;
        if executable.to_string_lossy().ends_with(" (deleted)") {
            return Err(SecurityError::InvalidSignature(format!(
                "executable of pid {pid} was replaced on disk"
            )));
        }

        let digest = sha256_file(&exe)
            .map_err(|e| SecurityError::InvalidSignature(format!("{}: {e}", exe.display())))?;
        Ok(CodeIdentity {
            pid,
            executable,
            digest,
        })
    }

    fn check_validity(&self, identity: &CodeIdentity) -> Result<(), SecurityError> {
        let entry = self.entry(identity)?;
        if entry.sha256 != identity.digest {
            return Err(SecurityError::InvalidSignature(format!(
                "digest of {} does not match its signature",
                identity.executable.display()
            )));
        }
        Ok(())
    }

    fn signing_info(&self, identity: &CodeIdentity) -> Result<SigningInfo, SecurityError> {
        let entry = self.entry(identity)?;
        Ok(SigningInfo {
            bundle_id: entry.bundle_id.clone(),
            team_id: entry.team_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        Authenticator, PeerContext, SigningRequirement, EXPECTED_BUNDLE_ID, EXPECTED_TEAM_ID,
    };
    use crate::error::ErrorKind;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    const PID: i32 = 4242;

    struct FakeProc {
        root: TempDir,
        binary: PathBuf,
    }

    impl FakeProc {
        /// A proc tree where `PID` runs a binary with the given contents.
        fn new(contents: &[u8]) -> Self {
            let root = tempfile::tempdir().unwrap();
            let binary = root.path().join("diskgate-gui");
            std::fs::write(&binary, contents).unwrap();
            let pid_dir = root.path().join("proc").join(PID.to_string());
            std::fs::create_dir_all(&pid_dir).unwrap();
            symlink(&binary, pid_dir.join("exe")).unwrap();
            Self { root, binary }
        }

        fn source(&self, signers: Vec<SignerEntry>) -> ProcCodeIdentitySource {
            ProcCodeIdentitySource::with_proc_root(
                self.root.path().join("proc"),
                SigningManifest { signers },
            )
        }

        fn signer(&self, sha256: String, team_id: &str) -> SignerEntry {
            SignerEntry {
                path: self.binary.clone(),
                sha256,
                bundle_id: EXPECTED_BUNDLE_ID.into(),
                team_id: team_id.into(),
            }
        }
    }

    fn digest_of(contents: &[u8]) -> String {
        hex::encode(Sha256::digest(contents))
    }

    fn peer() -> PeerCredentials {
        PeerCredentials {
            uid: 501,
            pid: Some(PID),
        }
    }

    #[test]
    fn signed_binary_is_trusted() {
        let fake = FakeProc::new(b"trusted gui");
        let source = fake.source(vec![fake.signer(digest_of(b"trusted gui"), EXPECTED_TEAM_ID)]);

        let identity = source.code_identity(&peer()).unwrap();
        assert_eq!(identity.executable, fake.binary);
        assert_eq!(identity.digest, digest_of(b"trusted gui"));

        let auth = Authenticator::new(source, SigningRequirement::default());
        let client = auth.authenticate(&peer()).unwrap();
        assert_eq!(client.bundle_id, EXPECTED_BUNDLE_ID);
        assert!(client.signature_valid);
    }

    #[test]
    fn tampered_binary_fails_validity() {
        let fake = FakeProc::new(b"patched gui");
        let source = fake.source(vec![fake.signer(digest_of(b"trusted gui"), EXPECTED_TEAM_ID)]);
        let auth = Authenticator::new(source, SigningRequirement::default());
        assert_eq!(
            auth.authenticate(&peer()).unwrap_err().kind(),
            ErrorKind::InvalidSignature
        );
    }

    #[test]
    fn unknown_binary_and_wrong_team_are_refused() {
        let fake = FakeProc::new(b"gui");
        let auth = Authenticator::new(fake.source(Vec::new()), SigningRequirement::default());
        assert_eq!(
            auth.authenticate(&peer()).unwrap_err().kind(),
            ErrorKind::InvalidSignature
        );

        let source = fake.source(vec![fake.signer(digest_of(b"gui"), "OTHERTEAM1")]);
        let auth = Authenticator::new(source, SigningRequirement::default());
        assert_eq!(
            auth.authenticate(&peer()).unwrap_err().kind(),
            ErrorKind::IdentityMismatch
        );
    }

    #[test]
    fn digest_is_lowercase_hex() {
        let fake = FakeProc::new(b"abc");
        let identity = fake.source(Vec::new()).code_identity(&peer()).unwrap();
        assert_eq!(
            identity.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn exec_into_another_signed_binary_is_refused_on_the_same_connection() {
        let fake = FakeProc::new(b"trusted gui");
        let other = fake.root.path().join("other-signed-tool");
        std::fs::write(&other, b"other tool").unwrap();
        let mut other_signer = fake.signer(digest_of(b"other tool"), EXPECTED_TEAM_ID);
        other_signer.path = other.clone();
        let source = fake.source(vec![
            fake.signer(digest_of(b"trusted gui"), EXPECTED_TEAM_ID),
            other_signer,
        ]);
        let auth = Authenticator::new(source, SigningRequirement::default());

        let mut connection = PeerContext::new(peer());
        auth.pin(&mut connection);
        assert!(auth.authenticate_peer(&mut connection).is_ok());

        let exe = fake.root.path().join("proc").join(PID.to_string()).join("exe");
        std::fs::remove_file(&exe).unwrap();
        symlink(&other, &exe).unwrap();

        assert_eq!(
            auth.authenticate_peer(&mut connection).unwrap_err().kind(),
            ErrorKind::InvalidSignature
        );
        // A fresh connection from that image is judged on its own.
        assert!(auth.authenticate_peer(&mut PeerContext::new(peer())).is_ok());
    }

    #[test]
    fn replaced_executable_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let pid_dir = root.path().join(PID.to_string());
        std::fs::create_dir_all(&pid_dir).unwrap();
        symlink("/usr/bin/diskgate-gui (deleted)", pid_dir.join("exe")).unwrap();
        let source = ProcCodeIdentitySource::with_proc_root(root.path(), SigningManifest::default());
        assert!(matches!(
            source.code_identity(&peer()),
            Err(SecurityError::InvalidSignature(_))
        ));
    }

    #[test]
    fn missing_pid_or_process_fails_closed() {
        let fake = FakeProc::new(b"gui");
        let source = fake.source(Vec::new());
        let no_pid = PeerCredentials { uid: 501, pid: None };
        assert!(matches!(
            source.code_identity(&no_pid),
            Err(SecurityError::CredentialsUnavailable(_))
        ));
        let gone = PeerCredentials {
            uid: 501,
            pid: Some(PID + 1),
        };
        assert!(source.code_identity(&gone).is_err());
    }
}
