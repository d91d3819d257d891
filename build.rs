fn main() {
    // Only run gRPC codegen when the "grpc" feature is enabled.
    // Cargo sets CARGO_FEATURE_GRPC when compiling with --features grpc.
    if std::env::var("CARGO_FEATURE_GRPC").is_ok() {
        let service = tonic_build::manual::Service::builder()
            .name("LogService")
            .package("logs")
            .method(
                tonic_build::manual::Method::builder()
                    .name("write_log")
                    .route_name("WriteLog")
                    .input_type("crate::transport::grpc::LogRequest")
                    .output_type("crate::transport::grpc::LogResponse")
                    .codec_path("tonic::codec::ProstCodec")
                    .build(),
            )
            .build();

        tonic_build::manual::Builder::new().compile(&[service]);
    }
}
