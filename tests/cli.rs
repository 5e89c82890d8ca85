use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_pack_list_extract_cycle() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup: a source tree with a nested directory
    let source_dir = tempdir()?;
    let file1_path = source_dir.path().join("file1.txt");
    let file2_path = source_dir.path().join("file2.log");
    let nested_dir = source_dir.path().join("nested");
    fs::create_dir(&nested_dir)?;
    let nested_file_path = nested_dir.join("nested_file.dat");

    let mut file1 = fs::File::create(&file1_path)?;
    writeln!(file1, "Hello, this is the first file.")?;

    let mut file2 = fs::File::create(&file2_path)?;
    writeln!(file2, "Some log data here.")?;

    let mut nested_file = fs::File::create(&nested_file_path)?;
    nested_file.write_all(&[0, 1, 2, 3, 4, 5])?;

    let archive_dir = tempdir()?;
    let archive_path = archive_dir.path().join("site.wprime");

    // 2. Pack
    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("pack")
        .arg(source_dir.path())
        .arg("--output")
        .arg(&archive_path)
        .arg("--site-title")
        .arg("CLI Fixture");
    cmd.assert().success();

    assert!(archive_path.exists());

    // 3. List: entries carry the archive-local alias prefix
    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("list").arg(&archive_path);
    cmd.assert().success().stdout(
        predicate::str::contains("export/file1.txt")
            .and(predicate::str::contains("export/file2.log"))
            .and(predicate::str::contains("export/nested/nested_file.dat"))
            .and(predicate::str::contains("wprime-package.json")),
    );

    // 4. Verify: structure sound, sentinel present
    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("verify").arg(&archive_path);
    cmd.assert().success().stdout(
        predicate::str::contains("Structure: sound").and(predicate::str::contains("Closed: yes")),
    );

    // 5. Extract into a fresh directory
    let extract_dir = tempdir()?;
    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("extract")
        .arg(&archive_path)
        .arg("-o")
        .arg(extract_dir.path());
    cmd.assert().success();

    // 6. Compare extracted contents against the originals
    let extracted_file1 = fs::read(extract_dir.path().join("export/file1.txt"))?;
    assert_eq!(extracted_file1, fs::read(&file1_path)?);

    let extracted_file2 = fs::read(extract_dir.path().join("export/file2.log"))?;
    assert_eq!(extracted_file2, fs::read(&file2_path)?);

    let extracted_nested = fs::read(extract_dir.path().join("export/nested/nested_file.dat"))?;
    assert_eq!(extracted_nested, fs::read(&nested_file_path)?);

    Ok(())
}

#[test]
fn test_cli_encrypted_cycle_with_env_password() -> Result<(), Box<dyn std::error::Error>> {
    let source_dir = tempdir()?;
    let secret_path = source_dir.path().join("secret.txt");
    fs::write(&secret_path, "wp-config secrets live here")?;

    let archive_dir = tempdir()?;
    let archive_path = archive_dir.path().join("secure.wprime");

    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("pack")
        .arg(source_dir.path())
        .arg("--output")
        .arg(&archive_path)
        .env("WPRIME_PASSWORD", "correct horse battery");
    cmd.assert().success();

    // The plaintext must not appear anywhere in the container.
    let raw = fs::read(&archive_path)?;
    assert!(!raw
        .windows(b"wp-config secrets".len())
        .any(|w| w == b"wp-config secrets"));

    let extract_dir = tempdir()?;
    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("extract")
        .arg(&archive_path)
        .arg("-o")
        .arg(extract_dir.path())
        .env("WPRIME_PASSWORD", "correct horse battery");
    cmd.assert().success();

    let extracted = fs::read(extract_dir.path().join("export/secret.txt"))?;
    assert_eq!(extracted, fs::read(&secret_path)?);

    Ok(())
}

#[test]
fn test_cli_verify_flags_truncated_archive() -> Result<(), Box<dyn std::error::Error>> {
    let source_dir = tempdir()?;
    fs::write(source_dir.path().join("data.bin"), vec![7u8; 4096])?;

    let archive_dir = tempdir()?;
    let archive_path = archive_dir.path().join("damaged.wprime");

    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("pack")
        .arg(source_dir.path())
        .arg("--output")
        .arg(&archive_path);
    cmd.assert().success();

    // Chop off the tail, sentinel and terminator included.
    let len = fs::metadata(&archive_path)?.len();
    let f = fs::OpenOptions::new().write(true).open(&archive_path)?;
    f.set_len(len / 2)?;

    let mut cmd = Command::cargo_bin("wprime")?;
    cmd.arg("verify").arg(&archive_path);
    cmd.assert()
        .failure()
        .stdout(predicate::str::contains("CORRUPTED"));

    Ok(())
}
