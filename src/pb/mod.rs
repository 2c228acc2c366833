//! Protobuf types and service stubs for `proto/processor.proto`.
//!
//! The contents of [`v1`] are committed `tonic-build` output so the crate
//! builds without a `protoc` toolchain; the proto file remains the source of
//! truth. Regenerate after editing the schema.

pub mod v1 {
    include!("headroom.v1.rs");
}
