use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("antcode_worker.bin"))
        .build_server(true)
        .build_client(true)
        .compile(&["proto/antcode/worker.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/antcode/worker.proto");
    Ok(())
}
