fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_prost_build::compile_protos("proto/agent.proto")?;

    println!("cargo:rerun-if-changed=proto/agent.proto");

    Ok(())
}
