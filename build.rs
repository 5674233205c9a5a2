use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/ffi");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    // Generate the C header for the native entry API
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let include_dir = PathBuf::from(&crate_dir).join("include");
    let output_path = include_dir.join("mintvm.h");

    std::fs::create_dir_all(&include_dir).ok();

    let config = cbindgen::Config::from_file(PathBuf::from(&crate_dir).join("cbindgen.toml"))
        .unwrap_or_else(|_| cbindgen::Config::default());

    if let Err(e) = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
        .map(|bindings| bindings.write_to_file(&output_path))
    {
        println!("cargo:warning=failed to generate C header: {e}");
    }
}
