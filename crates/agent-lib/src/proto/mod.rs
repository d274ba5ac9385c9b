//! Protobuf messages and client for the core control-plane service
//!
//! Hand-maintained subset of the `pb.CoreRPC` service: only the calls the
//! agent makes are declared here.

pub mod pb {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Empty {}

    #[derive(Clone, PartialEq, Message)]
    pub struct GetNodeOptions {
        #[prost(string, tag = "1")]
        pub nodename: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Node {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub endpoint: String,
        #[prost(string, tag = "3")]
        pub podname: String,
        #[prost(bool, tag = "4")]
        pub available: bool,
        #[prost(map = "string, string", tag = "5")]
        pub labels: ::std::collections::HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Nodes {
        #[prost(message, repeated, tag = "1")]
        pub nodes: Vec<Node>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ListNodesOptions {
        #[prost(string, tag = "1")]
        pub podname: String,
        #[prost(bool, tag = "2")]
        pub all: bool,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct WorkloadStatus {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(bool, tag = "2")]
        pub running: bool,
        #[prost(bool, tag = "3")]
        pub healthy: bool,
        #[prost(map = "string, string", tag = "4")]
        pub networks: ::std::collections::HashMap<String, String>,
        #[prost(bytes = "vec", tag = "5")]
        pub extension: Vec<u8>,
        #[prost(int64, tag = "6")]
        pub ttl: i64,
        #[prost(string, tag = "7")]
        pub appname: String,
        #[prost(string, tag = "8")]
        pub entrypoint: String,
        #[prost(string, tag = "9")]
        pub nodename: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct SetWorkloadsStatusOptions {
        #[prost(message, repeated, tag = "1")]
        pub status: Vec<WorkloadStatus>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct WorkloadsStatus {
        #[prost(message, repeated, tag = "1")]
        pub status: Vec<WorkloadStatus>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct SetNodeStatusOptions {
        #[prost(string, tag = "1")]
        pub nodename: String,
        #[prost(int64, tag = "2")]
        pub ttl: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NodeStatusStreamMessage {
        #[prost(string, tag = "1")]
        pub nodename: String,
        #[prost(string, tag = "2")]
        pub podname: String,
        #[prost(bool, tag = "3")]
        pub alive: bool,
        #[prost(string, tag = "4")]
        pub error: String,
    }

    pub mod core_rpc_client {
        use super::*;
        use tonic::codegen::*;

        #[derive(Debug, Clone)]
        pub struct CoreRpcClient<T> {
            inner: tonic::client::Grpc<T>,
        }

        impl CoreRpcClient<tonic::transport::Channel> {
            pub fn new(channel: tonic::transport::Channel) -> Self {
                let inner = tonic::client::Grpc::new(channel);
                Self { inner }
            }
        }

        impl<T> CoreRpcClient<T>
        where
            T: tonic::client::GrpcService<tonic::body::BoxBody>,
            T::Error: Into<StdError>,
            T::ResponseBody: Body<Data = Bytes> + Send + 'static,
            <T::ResponseBody as Body>::Error: Into<StdError> + Send,
        {
            async fn ready(&mut self) -> Result<(), tonic::Status> {
                self.inner.ready().await.map_err(|e| {
                    tonic::Status::new(
                        tonic::Code::Unknown,
                        format!("Service was not ready: {}", e.into()),
                    )
                })
            }

            pub async fn get_node(
                &mut self,
                request: impl tonic::IntoRequest<GetNodeOptions>,
            ) -> Result<tonic::Response<Node>, tonic::Status> {
                self.ready().await?;
                let codec = tonic::codec::ProstCodec::default();
                let path = http::uri::PathAndQuery::from_static("/pb.CoreRPC/GetNode");
                self.inner.unary(request.into_request(), path, codec).await
            }

            pub async fn list_pod_nodes(
                &mut self,
                request: impl tonic::IntoRequest<ListNodesOptions>,
            ) -> Result<tonic::Response<Nodes>, tonic::Status> {
                self.ready().await?;
                let codec = tonic::codec::ProstCodec::default();
                let path = http::uri::PathAndQuery::from_static("/pb.CoreRPC/ListPodNodes");
                self.inner.unary(request.into_request(), path, codec).await
            }

            pub async fn set_workloads_status(
                &mut self,
                request: impl tonic::IntoRequest<SetWorkloadsStatusOptions>,
            ) -> Result<tonic::Response<WorkloadsStatus>, tonic::Status> {
                self.ready().await?;
                let codec = tonic::codec::ProstCodec::default();
                let path =
                    http::uri::PathAndQuery::from_static("/pb.CoreRPC/SetWorkloadsStatus");
                self.inner.unary(request.into_request(), path, codec).await
            }

            pub async fn set_node_status(
                &mut self,
                request: impl tonic::IntoRequest<SetNodeStatusOptions>,
            ) -> Result<tonic::Response<Empty>, tonic::Status> {
                self.ready().await?;
                let codec = tonic::codec::ProstCodec::default();
                let path = http::uri::PathAndQuery::from_static("/pb.CoreRPC/SetNodeStatus");
                self.inner.unary(request.into_request(), path, codec).await
            }

            pub async fn node_status_stream(
                &mut self,
                request: impl tonic::IntoRequest<Empty>,
            ) -> Result<tonic::Response<tonic::codec::Streaming<NodeStatusStreamMessage>>, tonic::Status>
            {
                self.ready().await?;
                let codec = tonic::codec::ProstCodec::default();
                let path =
                    http::uri::PathAndQuery::from_static("/pb.CoreRPC/NodeStatusStream");
                self.inner
                    .server_streaming(request.into_request(), path, codec)
                    .await
            }
        }
    }
}

pub use pb::core_rpc_client::CoreRpcClient;
pub use pb::*;
