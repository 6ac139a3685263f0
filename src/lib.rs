pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod grpc;
pub mod instruction;
pub mod resource;
pub mod shutdown;
pub mod storage;
pub mod workdir;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("flowlet");
}
