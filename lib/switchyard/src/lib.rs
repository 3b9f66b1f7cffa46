//! Load-balanced TCP, UDP, HTTP and server-sent events clients.
//!
//! Clients are built through a [`ClientFactory`]. For each client, the factory fills in whatever the caller left out
//! (configuration, load balancer, retry policy, pipeline) with a protocol-appropriate default, and connects the client
//! to the one [`PoolMaintenanceScheduler`] shared by every pooled client in the process.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use bytes::Bytes;
//! use switchyard::{ClientConfiguration, ClientFactory, SharedScheduler};
//!
//! let factory = ClientFactory::new(SharedScheduler::default());
//! let client = factory
//!     .new_tcp_client()
//!     .with_configuration(ClientConfiguration {
//!         endpoints: vec!["127.0.0.1:7000".to_string()],
//!         ..Default::default()
//!     })
//!     .build()?;
//!
//! let response = client.execute(Bytes::from_static(b"ping")).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

pub mod client;
pub use self::client::{Http, HttpClient, Protocol, Sse, SseClient, Tcp, TcpClient, Udp, UdpClient};

mod config;
pub use self::config::ClientConfiguration;

pub mod endpoint;
pub use self::endpoint::{Endpoint, LoadBalancer, StaticLoadBalancer};

mod error;
pub use self::error::{ClientError, RequestError};

mod factory;
pub use self::factory::{ClientBuilder, ClientFactory};

pub mod maintenance;
pub use self::maintenance::{PoolMaintenanceScheduler, SchedulerError, SharedScheduler};

pub mod pipeline;

pub mod pool;

pub mod retry;
