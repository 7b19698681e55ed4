use tonic_build::manual::{Builder, Method, Service};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // The admission service carries serde types over a JSON codec, so the
    // service is described here instead of in a .proto file.
    let methods = [
        ("reserve", "Reserve", "ReserveRequest", "ReserveResponse"),
        ("batch_reserve", "BatchReserve", "BatchReserveRequest", "BatchReserveResponse"),
        ("complete", "Complete", "CompleteRequest", "CompleteResponse"),
        ("batch_complete", "BatchComplete", "BatchCompleteRequest", "BatchCompleteResponse"),
        ("put_limit", "PutLimit", "LimitDefinition", "AdminPutResponse"),
        ("list_limits", "ListLimits", "ListLimitsRequest", "ListLimitsResponse"),
        ("get_limit", "GetLimit", "GetLimitRequest", "GetLimitResponse"),
    ];

    let mut service = Service::builder()
        .name("Admission")
        .package("admission.v1");

    for (name, route, input, output) in methods {
        service = service.method(
            Method::builder()
                .name(name)
                .route_name(route)
                .input_type(format!("crate::grpc::wire::{}", input))
                .output_type(format!("crate::grpc::wire::{}", output))
                .codec_path("crate::grpc::codec::JsonCodec")
                .build(),
        );
    }

    Builder::new().compile(&[service.build()]);
}
