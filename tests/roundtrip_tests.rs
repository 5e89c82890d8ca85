//! Bit-for-bit round-trip coverage, including zero-byte files, sizes at and
//! around the chunk and block boundaries, and encrypted archives.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tempfile::tempdir;

use wprime::config::{ConfigManager, ExportMetadata};
use wprime::crypto;
use wprime::pack::{self, PackRequest};
use wprime::resume::TimeBudget;
use wprime::walker::{ExportMode, NoExclusions};

// ---------- helpers ----------

fn create_sized_files(dir: &Path, sizes: &[usize]) -> Vec<(String, Vec<u8>)> {
    let mut rng = rand::thread_rng();
    let mut created = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let name = format!("file_{i:03}_{size}.bin");
        let mut data = vec![0u8; size];
        rng.fill_bytes(&mut data);
        fs::write(dir.join(&name), &data).unwrap();
        created.push((name, data));
    }
    created
}

fn write_list(dir: &Path, names: &[String]) -> PathBuf {
    let list_path = dir.join("filelist.txt");
    let mut list = fs::File::create(&list_path).unwrap();
    for name in names {
        writeln!(list, "{}", dir.join(name).display()).unwrap();
    }
    list_path
}

fn metadata(encrypted: bool, key: Option<[u8; crypto::KEY_SIZE]>) -> ExportMetadata {
    ExportMetadata {
        export_options: Some("complete_export".into()),
        site_title: Some("Round Trip Fixtures".into()),
        include_users: Some(true),
        export_type: Some("single-site-export".into()),
        target_id: Some(1),
        root_folder: Some("export".into()),
        encrypted,
        key,
        extra: Default::default(),
    }
}

fn pack_dir(
    src: &Path,
    list_path: &Path,
    archive: &Path,
    key: Option<[u8; crypto::KEY_SIZE]>,
) -> u64 {
    let temp = tempdir().unwrap();
    let request = PackRequest {
        list_path,
        root: src,
        alias: "export",
        output: archive,
        blog_id: 1,
        mode: ExportMode::General,
        key,
        remap: None,
        metadata: metadata(key.is_some(), key),
        temp_folder: Some(temp.path()),
    };
    let mut config = ConfigManager::new();
    pack::pack_to_completion(&request, &NoExclusions, &mut config, TimeBudget::unlimited).unwrap()
}

// ---------- tests ----------

#[test]
fn plain_roundtrip_across_boundary_sizes() {
    let src = tempdir().unwrap();
    // Zero bytes, around the 512-byte block boundary, around the 64 KiB chunk
    // boundary, and a multi-chunk file.
    let sizes = [0, 1, 511, 512, 513, 65_535, 65_536, 65_537, 300_000];
    let files = create_sized_files(src.path(), &sizes);
    let list = write_list(src.path(), &files.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>());

    let arch_dir = tempdir().unwrap();
    let archive = arch_dir.path().join("fixtures.wprime");
    pack_dir(src.path(), &list, &archive, None);

    let out = tempdir().unwrap();
    pack::extract_to_completion(&archive, out.path(), None, TimeBudget::unlimited).unwrap();

    for (name, data) in &files {
        let extracted = fs::read(out.path().join("export").join(name)).unwrap();
        assert_eq!(&extracted, data, "mismatch for {}", name);
    }
}

#[test]
fn encrypted_roundtrip() {
    let src = tempdir().unwrap();
    let files = create_sized_files(src.path(), &[0, 700, 66_000, 250_000]);
    let list = write_list(src.path(), &files.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>());

    let salt = crypto::generate_salt();
    let key = crypto::derive_key("correct horse battery staple", &salt);

    let arch_dir = tempdir().unwrap();
    let archive = arch_dir.path().join("secret.wprime");
    pack_dir(src.path(), &list, &archive, Some(key));

    // Ciphertext must not leak a plaintext window.
    let raw = fs::read(&archive).unwrap();
    let (_, biggest) = files.iter().max_by_key(|(_, d)| d.len()).unwrap();
    let probe = &biggest[1000..1032];
    assert!(
        !raw.windows(probe.len()).any(|w| w == probe),
        "plaintext found inside an encrypted archive"
    );

    let out = tempdir().unwrap();
    pack::extract_to_completion(&archive, out.path(), Some(&key), TimeBudget::unlimited).unwrap();
    for (name, data) in &files {
        let extracted = fs::read(out.path().join("export").join(name)).unwrap();
        assert_eq!(&extracted, data, "mismatch for {}", name);
    }
}

#[test]
fn extracting_encrypted_archive_without_key_fails() {
    let src = tempdir().unwrap();
    let files = create_sized_files(src.path(), &[4096]);
    let list = write_list(src.path(), &files.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>());

    let key = crypto::derive_key("pw", &crypto::generate_salt());
    let arch_dir = tempdir().unwrap();
    let archive = arch_dir.path().join("locked.wprime");
    pack_dir(src.path(), &list, &archive, Some(key));

    let out = tempdir().unwrap();
    let res = pack::extract_to_completion(&archive, out.path(), None, TimeBudget::unlimited);
    assert!(matches!(res, Err(wprime::WprimeError::Crypto(_))));
}

#[test]
fn archive_offsets_account_for_every_byte() {
    let src = tempdir().unwrap();
    let files = create_sized_files(src.path(), &[100, 2000]);
    let list = write_list(src.path(), &files.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>());

    let arch_dir = tempdir().unwrap();
    let archive = arch_dir.path().join("sized.wprime");
    let reported = pack_dir(src.path(), &list, &archive, None);
    assert_eq!(reported, fs::metadata(&archive).unwrap().len());
    // Everything lands on block boundaries.
    assert_eq!(reported % 512, 0);
}
