//! Client side of the external configuration store ("databroker"): a
//! versioned key/value service with conditional writes, reached over gRPC.
//!
//! The reconciliation pipeline only depends on the [`StoreClient`] trait so
//! tests can run against an in-memory store.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request, Status};
use tracing::warn;
use url::Url;

pub mod applier;
pub mod lease;

// Generated from proto/databroker.proto
pub mod proto {
    tonic::include_proto!("databroker");
}

use proto::data_broker_client::DataBrokerClient;

const RPC_TIMEOUT: Duration = Duration::from_secs(60);
const JWT_TTL_SECONDS: i64 = 60;

/// A versioned record read back from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub data: Vec<u8>,
    pub version: u64,
    pub modified_at: DateTime<Utc>,
}

/// Write precondition for [`StoreClient::put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutCondition {
    /// Last write wins.
    Any,
    /// The key must not exist yet.
    Absent,
    /// The key must currently be at this version.
    Version(u64),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("databroker unavailable: {0}")]
    Unavailable(String),
    #[error("version conflict")]
    VersionConflict,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("databroker error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Transient errors are retried with backoff; the rest are surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Internal(_))
    }
}

impl From<Status> for StoreError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
                StoreError::Unavailable(status.message().to_string())
            }
            Code::FailedPrecondition | Code::AlreadyExists | Code::Aborted => {
                StoreError::VersionConflict
            }
            Code::InvalidArgument => StoreError::InvalidArgument(status.message().to_string()),
            _ => StoreError::Internal(status.message().to_string()),
        }
    }
}

/// The store operations the pipeline depends on.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    /// Returns the new version of the key on success.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        condition: PutCondition,
    ) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError>;
}

/// Connection settings for the gRPC store, assembled from the CLI flags.
#[derive(Clone, Debug, Default)]
pub struct StoreOptions {
    pub service_url: String,
    /// PEM bundle, already read from file or decoded from base64.
    pub tls_ca: Option<Vec<u8>>,
    pub tls_insecure_skip_verify: bool,
    pub tls_override_certificate_name: Option<String>,
    /// Raw shared secret used to sign a JWT on every outbound RPC.
    pub shared_secret: Option<Vec<u8>>,
}

impl StoreOptions {
    /// Decode a base64 shared secret from the CLI.
    pub fn decode_shared_secret(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(value)
    }
}

#[derive(Serialize)]
struct JwtClaims {
    iss: &'static str,
    aud: &'static str,
    iat: i64,
    exp: i64,
}

/// Signs a short-lived JWT into the `authorization` metadata of every call.
#[derive(Clone)]
pub struct AuthInterceptor {
    key: Option<EncodingKey>,
}

impl tonic::service::Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(key) = &self.key {
            let now = Utc::now();
            let claims = JwtClaims {
                iss: "pomerium-ingress-controller",
                aud: "databroker",
                iat: now.timestamp(),
                exp: now.timestamp() + JWT_TTL_SECONDS,
            };
            let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, key)
                .map_err(|e| Status::internal(format!("sign request jwt: {e}")))?;
            let value = MetadataValue::try_from(format!("Bearer {token}"))
                .map_err(|e| Status::internal(format!("authorization metadata: {e}")))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

/// gRPC-backed [`StoreClient`].
#[derive(Clone)]
pub struct GrpcStore {
    client: DataBrokerClient<InterceptedService<Channel, AuthInterceptor>>,
}

impl GrpcStore {
    pub async fn connect(opts: &StoreOptions) -> Result<Self, crate::Error> {
        let url = Url::parse(&opts.service_url)?;
        let mut endpoint = Endpoint::from_shared(opts.service_url.clone())
            .map_err(|e| crate::Error::InvalidConfig(format!("databroker service url: {e}")))?
            .connect_timeout(Duration::from_secs(10))
            .timeout(RPC_TIMEOUT);

        if url.scheme() == "https" || opts.tls_ca.is_some() {
            let mut tls = ClientTlsConfig::new().with_native_roots();
            if let Some(ca) = &opts.tls_ca {
                tls = tls.ca_certificate(Certificate::from_pem(ca));
            }
            if let Some(name) = &opts.tls_override_certificate_name {
                tls = tls.domain_name(name.clone());
            }
            if opts.tls_insecure_skip_verify {
                // tonic offers no unverified mode; the closest is trusting the
                // platform roots without pinning.
                warn!("databroker-tls-insecure-skip-verify set, certificate chain is not pinned");
            }
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| crate::Error::InvalidConfig(format!("databroker tls: {e}")))?;
        }

        let channel = endpoint.connect_lazy();
        let interceptor = AuthInterceptor {
            key: opts
                .shared_secret
                .as_deref()
                .map(EncodingKey::from_secret),
        };
        Ok(Self {
            client: DataBrokerClient::with_interceptor(channel, interceptor),
        })
    }
}

fn record_from_proto(record: proto::Record) -> Record {
    Record {
        data: record.data,
        version: record.version,
        modified_at: Utc
            .timestamp_millis_opt(record.modified_at)
            .single()
            .unwrap_or_default(),
    }
}

#[async_trait]
impl StoreClient for GrpcStore {
    async fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let mut client = self.client.clone();
        match client.get(proto::GetRequest { key: key.into() }).await {
            Ok(response) => Ok(response.into_inner().record.map(record_from_proto)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status.into()),
        }
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        condition: PutCondition,
    ) -> Result<u64, StoreError> {
        let (unconditional, expect_version) = match condition {
            PutCondition::Any => (true, 0),
            PutCondition::Absent => (false, 0),
            PutCondition::Version(v) => (false, v),
        };
        let mut client = self.client.clone();
        let response = client
            .put(proto::PutRequest {
                key: key.into(),
                data,
                unconditional,
                expect_version,
            })
            .await?;
        Ok(response.into_inner().version)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        match client.delete(proto::DeleteRequest { key: key.into() }).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => Ok(()),
            Err(status) => Err(status.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .list(proto::ListRequest {
                prefix: prefix.into(),
            })
            .await?;
        Ok(response
            .into_inner()
            .records
            .into_iter()
            .filter_map(|kr| kr.record.map(|r| (kr.key, record_from_proto(r))))
            .collect())
    }
}
