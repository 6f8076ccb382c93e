//! Key material resolution against config.

use veil::cipher::KeyMaterial;
use veil::config::CipherConfig;
use veil::keys::{generate_key_material, load_key_material_with, write_keys_file};

#[test]
fn custom_env_names_are_honoured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cipher = CipherConfig {
        key_env: "APP_KEY".to_owned(),
        iv_env: "APP_IV".to_owned(),
        ..CipherConfig::default()
    };
    let env = |key: &str| -> Option<String> {
        match key {
            "APP_KEY" => Some("00112233445566778899aabbccddeeff".to_owned()),
            "APP_IV" => Some("ffeeddccbbaa99887766554433221100".to_owned()),
            _ => None,
        }
    };

    let material = load_key_material_with(&cipher, &dir.path().join("keys.env"), env).expect("load");
    let expected = KeyMaterial::from_hex(
        "00112233445566778899aabbccddeeff",
        "ffeeddccbbaa99887766554433221100",
    )
    .expect("hex");
    assert_eq!(material, expected);
}

#[test]
fn partial_env_falls_back_to_key_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keys = dir.path().join("keys.env");
    let cipher = CipherConfig::default();
    let material = generate_key_material().expect("generate");
    write_keys_file(&keys, &cipher, &material).expect("write");

    let only_key = |key: &str| (key == "VEIL_KEY").then(|| "00".repeat(16));
    let loaded = load_key_material_with(&cipher, &keys, only_key).expect("load");
    assert_eq!(loaded, material);
}

#[test]
fn generated_material_differs() {
    let a = generate_key_material().expect("generate");
    let b = generate_key_material().expect("generate");
    assert_ne!(a, b);
}
