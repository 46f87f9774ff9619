//! End-to-end bundling and resolution.
//!
//! Each test bundles small workspaces into a scratch directory, finalizes the
//! run and inspects the resulting `<name>.tar` the way a consumer would.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bob_bundle::{
    unpack_aggregate, BundleConfig, BundleError, BundleRun, CancelToken, Manifest, Offloader,
    PackageStep, Unbundler, VariantId,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (rel, data) in files {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }
    dir
}

fn step(ws: &Path, package: &str, recipe: &str, variant: &str) -> PackageStep {
    PackageStep::new(ws, package, recipe, VariantId::from_hex(variant).unwrap())
}

/// All entries of an uncompressed tar, in archive order.
fn read_tar(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(fs::File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            e.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_packages_produce_sorted_manifest() {
    init_tracing();
    let out = TempDir::new().unwrap();
    let p1 = workspace(&[("bin/p1", "one")]);
    let p2 = workspace(&[("lib/p2.so", "two"), ("share/doc", "docs")]);

    let run = BundleRun::new_in(out.path(), &BundleConfig::new("rel1")).unwrap();
    let pool = Offloader::new(2);
    let staging = run.staging_dir().to_path_buf();

    // Submitted out of order and concurrently.
    let s2 = step(p2.path(), "P2", "recipe-two", "bb22");
    let s1 = step(p1.path(), "P1", "recipe-one", "aa11");
    let (r2, r1) = tokio::join!(run.bundle(&s2, &pool), run.bundle(&s1, &pool));
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();

    let bundle = run.finalize().unwrap();
    assert_eq!(bundle, out.path().join("rel1.tar"));
    assert!(!staging.exists(), "staging must be cleaned up");

    let entries = read_tar(&bundle);
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "rel1/recipe-one/aa11/bundle.tgz",
            "rel1/recipe-two/bb22/bundle.tgz",
            "rel1/rel1.yaml",
        ]
    );

    let yaml = String::from_utf8(entries[2].1.clone()).unwrap();
    let manifest = Manifest::from_yaml_str(&yaml).unwrap();
    assert_eq!(manifest.len(), 2);
    let first = &manifest.entries()[0];
    let second = &manifest.entries()[1];
    assert_eq!((first.variant_id.as_str(), first.name.as_str()), ("aa11", "recipe-one"));
    assert_eq!((second.variant_id.as_str(), second.name.as_str()), ("bb22", "recipe-two"));
    assert_eq!(first.digest_sha256, sha256_hex(&entries[0].1));
    assert_eq!(second.digest_sha256, sha256_hex(&entries[1].1));
}

#[tokio::test]
async fn excluded_package_leaves_no_trace() {
    let out = TempDir::new().unwrap();
    let ws = workspace(&[("f", "x")]);
    let config = BundleConfig::new("rel1").with_excludes(["internal-*"]);
    let run = BundleRun::new_in(out.path(), &config).unwrap();
    let pool = Offloader::new(1);

    let internal = step(ws.path(), "internal-tools", "internal-tools", "cc33");
    assert!(run.bundle(&internal, &pool).await.unwrap().is_none());

    assert!(run.artifacts().is_empty());
    assert_eq!(fs::read_dir(run.staging_dir()).unwrap().count(), 0);

    let bundle = run.finalize().unwrap();
    let entries = read_tar(&bundle);
    assert_eq!(entries.len(), 1);
    let manifest = Manifest::from_yaml_str(std::str::from_utf8(&entries[0].1).unwrap()).unwrap();
    assert!(manifest.is_empty());
}

#[test]
fn existing_bundle_is_never_overwritten() {
    let out = TempDir::new().unwrap();
    let existing = out.path().join("rel1.tar");
    fs::write(&existing, b"previous bundle").unwrap();

    let err = BundleRun::new_in(out.path(), &BundleConfig::new("rel1")).unwrap_err();
    assert!(matches!(err, BundleError::AlreadyExists { ref path } if path == &existing));
    assert_eq!(fs::read(&existing).unwrap(), b"previous bundle");
    assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_package_does_not_affect_siblings() {
    let out = TempDir::new().unwrap();
    let a = workspace(&[("a", "a")]);
    let b = workspace(&[("b", "b")]);
    let c = workspace(&[("c", "c")]);

    let run = BundleRun::new_in(out.path(), &BundleConfig::new("batch")).unwrap();
    let pool = Offloader::new(3);

    let interrupted = pool.cancel_token().child();
    interrupted.cancel();

    let (sa, sb, sc) = (
        step(a.path(), "a", "ra", "01"),
        step(b.path(), "b", "rb", "02"),
        step(c.path(), "c", "rc", "03"),
    );
    let (ra, rb, rc) = tokio::join!(
        run.bundle(&sa, &pool),
        run.bundle_with_cancel(&sb, &pool, interrupted),
        run.bundle(&sc, &pool),
    );

    ra.unwrap().unwrap();
    rc.unwrap().unwrap();
    let err = rb.unwrap_err();
    assert!(err.is_interrupted(), "got {err:?}");
    assert!(!err.is_retryable());

    let recorded: Vec<String> = run.artifacts().into_keys().collect();
    assert_eq!(recorded, vec!["01", "03"]);

    let bundle = run.finalize().unwrap();
    let entries = read_tar(&bundle);
    let manifest = Manifest::from_yaml_str(std::str::from_utf8(&entries.last().unwrap().1).unwrap())
        .unwrap();
    let ids: Vec<&str> = manifest.entries().iter().map(|e| e.variant_id.as_str()).collect();
    assert_eq!(ids, vec!["01", "03"]);
}

/// Incompressible filler, large enough that encoding it takes a while.
fn noise(len: usize) -> Vec<u8> {
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn package_cancelled_mid_archive_does_not_affect_siblings() {
    init_tracing();
    let out = TempDir::new().unwrap();
    let a = workspace(&[("a", "a")]);
    let b = workspace(&[("share/readme", "b")]);
    fs::write(b.path().join("share/big.bin"), noise(48 << 20)).unwrap();
    let c = workspace(&[("c", "c")]);

    let run = BundleRun::new_in(out.path(), &BundleConfig::new("batch")).unwrap();
    let pool = Offloader::new(3);
    let cancel = pool.cancel_token().child();
    let in_progress = run.staging_dir().join("rb").join("02").join("bundle.tgz");

    let (sa, sb, sc) = (
        step(a.path(), "a", "ra", "01"),
        step(b.path(), "b", "rb", "02"),
        step(c.path(), "c", "rc", "03"),
    );
    let canceller = async {
        // Wait until compressed output of the large workspace is hitting disk.
        let started = tokio::time::timeout(Duration::from_secs(30), async {
            while fs::metadata(&in_progress).map(|m| m.len()).unwrap_or(0) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        cancel.cancel();
        started
    };
    let (ra, rb, rc, started) = tokio::join!(
        run.bundle(&sa, &pool),
        run.bundle_with_cancel(&sb, &pool, cancel.clone()),
        run.bundle(&sc, &pool),
        canceller,
    );

    started.expect("large encode never started writing");
    ra.unwrap().unwrap();
    rc.unwrap().unwrap();
    let err = rb.unwrap_err();
    assert!(err.is_interrupted(), "got {err:?}");

    let bundle = run.finalize().unwrap();
    let names: Vec<String> = read_tar(&bundle).into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        names,
        vec![
            "batch/ra/01/bundle.tgz",
            "batch/rc/03/bundle.tgz",
            "batch/batch.yaml",
        ]
    );
}

#[tokio::test]
async fn shut_down_pool_interrupts_bundling() {
    let out = TempDir::new().unwrap();
    let ws = workspace(&[("f", "x")]);
    let run = BundleRun::new_in(out.path(), &BundleConfig::new("rel1")).unwrap();
    let pool = Offloader::new(1);
    pool.shutdown();

    let err = run
        .bundle(&step(ws.path(), "p", "r", "aa"), &pool)
        .await
        .unwrap_err();
    assert!(err.is_interrupted());
    assert!(run.artifacts().is_empty());
}

#[tokio::test]
async fn encode_failure_is_reported_with_cause() {
    let out = TempDir::new().unwrap();
    let run = BundleRun::new_in(out.path(), &BundleConfig::new("rel1")).unwrap();
    let pool = Offloader::new(1);

    let missing = out.path().join("no-such-workspace");
    let err = run
        .bundle(&step(&missing, "p", "r", "aa"), &pool)
        .await
        .unwrap_err();
    match err {
        BundleError::Encode { workspace, .. } => assert_eq!(workspace, missing),
        other => panic!("expected encode failure, got {other:?}"),
    }
    assert!(!out.path().join("rel1.tar").exists());
}

#[tokio::test]
async fn resolves_every_bundled_variant() {
    let out = TempDir::new().unwrap();
    let p1 = workspace(&[("bin/p1", "one"), ("etc/p1.conf", "cfg")]);
    let p2 = workspace(&[("lib/p2.so", "two")]);

    let run = BundleRun::new_in(out.path(), &BundleConfig::new("rel1")).unwrap();
    let pool = Offloader::new(2);
    run.bundle(&step(p1.path(), "P1", "recipe-one", "aa11"), &pool)
        .await
        .unwrap();
    run.bundle(&step(p2.path(), "P2", "recipe-two", "bb22"), &pool)
        .await
        .unwrap();
    let bundle = run.finalize().unwrap();

    let unpacked = TempDir::new().unwrap();
    let manifest_path = unpack_aggregate(&bundle, unpacked.path()).unwrap();
    assert_eq!(manifest_path, unpacked.path().join("rel1").join("rel1.yaml"));

    let mut unbundler = Unbundler::default();
    unbundler.add_bundle(&manifest_path).unwrap();
    let manifest = Manifest::load(&manifest_path).unwrap();

    for entry in manifest.entries() {
        let variant = VariantId::from_hex(&entry.variant_id).unwrap();
        let resolved = unbundler.get_from_bundle(&variant).unwrap();
        assert_eq!(resolved.digest, entry.digest_sha256);
        assert_eq!(resolved.bundle, manifest_path);
        assert_eq!(
            resolved.archive,
            unpacked
                .path()
                .join("rel1")
                .join(&entry.name)
                .join(&entry.variant_id)
                .join("bundle.tgz")
        );
        resolved.verify().unwrap();
    }

    assert!(unbundler
        .get_from_bundle(&VariantId::from_hex("cc33").unwrap())
        .is_none());

    // Round trip a workspace through the bundle.
    let restored = TempDir::new().unwrap();
    let resolved = unbundler
        .get_from_bundle(&VariantId::from_hex("aa11").unwrap())
        .unwrap();
    resolved
        .unpack_into(restored.path(), &CancelToken::new())
        .unwrap();
    assert_eq!(fs::read_to_string(restored.path().join("bin/p1")).unwrap(), "one");
    assert_eq!(
        fs::read_to_string(restored.path().join("etc/p1.conf")).unwrap(),
        "cfg"
    );
}

#[tokio::test]
async fn unpack_refuses_tampered_archive() {
    let out = TempDir::new().unwrap();
    let ws = workspace(&[("f", "x")]);
    let run = BundleRun::new_in(out.path(), &BundleConfig::new("rel1")).unwrap();
    let pool = Offloader::new(1);
    run.bundle(&step(ws.path(), "p", "r", "aa11"), &pool)
        .await
        .unwrap();
    let bundle = run.finalize().unwrap();

    let unpacked = TempDir::new().unwrap();
    let manifest_path = unpack_aggregate(&bundle, unpacked.path()).unwrap();
    let mut unbundler = Unbundler::default();
    unbundler.add_bundle(&manifest_path).unwrap();
    let resolved = unbundler
        .get_from_bundle(&VariantId::from_hex("aa11").unwrap())
        .unwrap();

    fs::write(&resolved.archive, b"not the original").unwrap();
    let restored = TempDir::new().unwrap();
    let err = resolved
        .unpack_into(restored.path(), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, BundleError::DigestMismatch { .. }), "{err:?}");
    assert_eq!(fs::read_dir(restored.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn aggregate_is_reproducible() {
    async fn build(out: &Path, mtime: u64) -> PathBuf {
        let ws = workspace(&[("bin/tool", "tool"), ("README", "readme")]);
        let file = fs::File::options()
            .write(true)
            .open(ws.path().join("README"))
            .unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(mtime))
            .unwrap();

        let run = BundleRun::new_in(out, &BundleConfig::new("rel1")).unwrap();
        let pool = Offloader::new(1);
        run.bundle(&step(ws.path(), "tool", "tool", "aa11"), &pool)
            .await
            .unwrap();
        run.finalize().unwrap()
    }

    let out_a = TempDir::new().unwrap();
    let out_b = TempDir::new().unwrap();
    let a = build(out_a.path(), 1_000).await;
    let b = build(out_b.path(), 1_700_000_000).await;
    assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
}
