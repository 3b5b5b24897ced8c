fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/wandersphere.proto");
    tonic_build::configure().compile_protos(&["proto/wandersphere.proto"], &["proto"])?;
    Ok(())
}
