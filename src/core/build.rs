//! Build script for vmpod-core
//!
//! Compiles the CRI proto definitions. Both halves are generated: the server
//! is served to the kubelet, the client is used to reach the in-VM agent.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/cri.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/cri.proto");

    Ok(())
}
