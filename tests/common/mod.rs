#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clientforge::{AccountRegistry, Config, PatchCatalog, Pipeline, RecordingRunner};

pub const BASE_BUNDLE_ID: &str = "com.example.client";

/// Thin little-endian Mach-O 64 image with a single `__TEXT` segment
/// covering `text_off..text_off+text_len`; filler byte `i` is `i % 251`.
pub fn macho_image(text_off: u64, text_len: u64, total_len: usize) -> Vec<u8> {
    let mut b = Vec::with_capacity(total_len);
    b.extend_from_slice(&0xfeed_facf_u32.to_le_bytes());
    b.extend_from_slice(&0x0100_000c_u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&2u32.to_le_bytes());
    b.extend_from_slice(&1u32.to_le_bytes());
    b.extend_from_slice(&72u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0x19u32.to_le_bytes());
    b.extend_from_slice(&72u32.to_le_bytes());
    let mut name = [0u8; 16];
    name[..6].copy_from_slice(b"__TEXT");
    b.extend_from_slice(&name);
    b.extend_from_slice(&0x1_0000_0000u64.to_le_bytes());
    b.extend_from_slice(&text_len.to_le_bytes());
    b.extend_from_slice(&text_off.to_le_bytes());
    b.extend_from_slice(&text_len.to_le_bytes());
    b.extend_from_slice(&5u32.to_le_bytes());
    b.extend_from_slice(&5u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    while b.len() < total_len {
        b.push((b.len() % 251) as u8);
    }
    b
}

pub fn info_plist(executable: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\">\n<dict>\n\t<key>CFBundleExecutable</key>\n\t<string>{executable}</string>\n\t<key>CFBundleIdentifier</key>\n\t<string>{BASE_BUNDLE_ID}</string>\n</dict>\n</plist>\n"
    )
}

/// Install `<clients>/<name>.app` with the given main executable bytes.
pub fn install_client(clients: &Path, name: &str, exe: &[u8]) -> PathBuf {
    let bundle = clients.join(format!("{name}.app"));
    fs::create_dir_all(bundle.join("Contents/MacOS")).expect("mkdir bundle");
    fs::create_dir_all(bundle.join("Contents/Resources")).expect("mkdir resources");
    fs::write(bundle.join("Contents/Info.plist"), info_plist(name)).expect("write plist");
    fs::write(bundle.join("Contents/Resources/strings.txt"), "hello\n").expect("write resource");
    fs::write(client_executable(&bundle, name), exe).expect("write exe");
    bundle
}

pub fn client_executable(bundle: &Path, name: &str) -> PathBuf {
    bundle.join("Contents/MacOS").join(name)
}

/// Config rooted entirely inside `root`, with no stagger.
pub fn test_config(root: &Path) -> Config {
    let mut cfg = Config::defaults(Some(root));
    cfg.data_root = root.join("data");
    cfg.clients_root = root.join("clients");
    cfg.catalog_path = None;
    cfg.codesign = PathBuf::from("/usr/bin/codesign");
    cfg.security = PathBuf::from("/usr/bin/security");
    cfg.launch_stagger = Duration::ZERO;
    cfg
}

pub fn pipeline(
    root: &Path,
    catalog: PatchCatalog,
    runner: Arc<RecordingRunner>,
    registry: Arc<dyn AccountRegistry>,
) -> Pipeline {
    Pipeline::new(test_config(root), Arc::new(catalog), runner, registry)
        .with_lock_wait(Duration::from_secs(5))
}

pub fn run_bin(args: &[&str], data_dir: &Path) -> std::process::Output {
    std::process::Command::new(env!("CARGO_BIN_EXE_clientforge"))
        .args(args)
        .env("CLIENTFORGE_DATA_DIR", data_dir)
        .env_remove("CLIENTFORGE_CONFIG")
        .env_remove("CLIENTFORGE_PATCH_CATALOG")
        .env_remove("CLIENTFORGE_CLIENTS_DIR")
        .env("NO_COLOR", "1")
        .output()
        .expect("failed to run clientforge")
}
