fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The generated client bindings are checked in under src/pubsub/generated.
    // Set PUBSUB_REGENERATE_PROTOS=1 (requires protoc) to rebuild them.
    println!("cargo:rerun-if-env-changed=PUBSUB_REGENERATE_PROTOS");
    println!("cargo:rerun-if-changed=proto/google/pubsub/v1/pubsub.proto");

    if std::env::var_os("PUBSUB_REGENERATE_PROTOS").is_none() {
        return Ok(());
    }

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .out_dir("src/pubsub/generated")
        .compile_protos(&["proto/google/pubsub/v1/pubsub.proto"], &["proto"])?;

    Ok(())
}
