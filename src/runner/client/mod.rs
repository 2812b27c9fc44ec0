mod request;

use crate::config::{CAData, ClientConfig, Credentials};
use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectIdRef, ResourceJson};
use crate::runner::metrics::ClientMetrics;
use crate::store::{Store, StoreError};

use async_trait::async_trait;
use bytes::Buf;
use futures_util::StreamExt;
use http::{Request, Response};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use lazy_static::lazy_static;
use openssl::pkey::PKey;
use openssl::ssl::{SslConnector, SslConnectorBuilder, SslMethod};
use openssl::x509::X509;
use regex::bytes::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::io;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref NEWLINE_REGEX: Regex = Regex::new("([\\r\\n]+)").unwrap();
}

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Http(http::StatusCode),
    Request(http::Error),
    InvalidEndpoint(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serde(e) => Some(e),
            Error::Request(e) => Some(e),
            Error::Http(_) | Error::InvalidEndpoint(_) => None,
        }
    }
}

impl Error {
    pub fn http(status: http::StatusCode) -> Error {
        Error::Http(status)
    }

    pub fn is_http_410(&self) -> bool {
        self.is_http_status(410)
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        match self {
            Error::Http(ref status) => status.as_u16() == code,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http(ref e) => write!(f, "Http Error: {}", e),
            Error::Request(ref e) => write!(f, "Invalid request: {}", e),
            Error::InvalidEndpoint(ref e) => write!(f, "Invalid api server endpoint: '{}'", e),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn decode_base64(name: &str, data: &str) -> Result<Vec<u8>, io::Error> {
    base64::decode(data)
        .map_err(|err| invalid_data(format!("Invalid base64 content of {}: {}", name, err)))
}

fn set_client_certificate(
    ssl: &mut SslConnectorBuilder,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(), io::Error> {
    let cert = X509::from_pem(cert_pem)?;
    let pkey = PKey::private_key_from_pem(key_pem)?;
    ssl.set_certificate(&cert)?;
    ssl.set_private_key(&pkey)?;
    // fails if the key doesn't belong to the certificate
    ssl.check_private_key()?;
    Ok(())
}

/// Api servers return list items without `apiVersion` and `kind`, so they're filled in from the
/// type that was requested
fn with_type(k8s_type: &K8sType, mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::String(k8s_type.api_version.to_owned()));
        obj.entry("kind")
            .or_insert_with(|| Value::String(k8s_type.kind.to_owned()));
    }
    value
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// A minimal api server client. It's cheap to clone, and all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(mut config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        match config.ca_data.take() {
            Some(CAData::Contents(certs)) => {
                // inline CA data, as it comes from a kubeconfig file, has to be added to the
                // cert store manually
                let decoded = decode_base64("certificate-authority-data", &certs)?;
                let certs = X509::stack_from_pem(decoded.as_slice())?;
                let cert_store = ssl.cert_store_mut();
                for cert in certs {
                    cert_store.add_cert(cert)?;
                }
            }
            Some(CAData::File(path)) => {
                ssl.set_ca_file(path.as_str())?;
            }
            None => {}
        }

        match config.credentials {
            Credentials::PemPath {
                ref certificate_path,
                ref private_key_path,
            } => {
                let cert = std::fs::read(certificate_path)?;
                let key = std::fs::read(private_key_path)?;
                set_client_certificate(&mut ssl, cert.as_slice(), key.as_slice())?;
            }
            Credentials::Pem {
                ref certificate_base64,
                ref private_key_base64,
            } => {
                let cert = decode_base64("client-certificate-data", certificate_base64)?;
                let key = decode_base64("client-key-data", private_key_base64)?;
                set_client_certificate(&mut ssl, cert.as_slice(), key.as_slice())?;
            }
            Credentials::Header(_) => {}
        }

        if config.verify_ssl_certs {
            ssl.set_verify(openssl::ssl::SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verification has been disabled! All connections to the Kubernetes api server will be insecure!");
            ssl.set_verify(openssl::ssl::SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let client = HyperClient::builder().build(https);

        let inner = ClientInner {
            http_client: client,
            config,
            metrics,
        };
        Ok(Client(Arc::new(inner)))
    }

    pub async fn list_all(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, label_selector, namespace)?;
        let mut list: ObjectList<Value> = self.get_response_body(req).await?;
        list.items = list
            .items
            .into_iter()
            .map(|item| with_type(k8s_type, item))
            .collect();
        Ok(list)
    }

    pub async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<LineDeserializer<WatchEvent>, Error> {
        let req = request::watch_request(
            &self.0.config,
            k8s_type,
            resource_version,
            label_selector,
            None,
            namespace,
        )?;
        self.get_response_lines_deserialized(req).await
    }

    pub async fn get_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<Value, Error> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        let body: Value = self.get_response_body(req).await?;
        Ok(with_type(k8s_type, body))
    }

    pub async fn create_resource(
        &self,
        k8s_type: &K8sType,
        resource: &Value,
    ) -> Result<Value, Error> {
        let req = request::create_request(&self.0.config, k8s_type, resource)?;
        self.execute_for_body(req).await
    }

    pub async fn replace_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<Value, Error> {
        let req = request::replace_request(&self.0.config, k8s_type, id, resource)?;
        self.execute_for_body(req).await
    }

    pub async fn update_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<Value, Error> {
        let req = request::update_status_request(&self.0.config, k8s_type, id, resource)?;
        self.execute_for_body(req).await
    }

    /// Deletes the object in the background. A 404 means that something else already deleted
    /// it, and a 409 that it's already being deleted, so both count as success.
    pub async fn delete_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), Error> {
        log::info!("Deleting {} '{}'", k8s_type, id);
        let req = request::delete_request(&self.0.config, k8s_type, id)?;
        let response = self.get_response(req).await?;
        match response.status().as_u16() {
            200..=299 | 404 | 409 => Ok(()),
            other => {
                log::error!("Delete request for {} '{}' failed with status: {}", k8s_type, id, other);
                Err(Error::http(response.status()))
            }
        }
    }

    /// Executes a write request. Error responses have their bodies logged, since the api server
    /// puts the explanation of validation failures and conflicts there.
    async fn execute_for_body(&self, req: Request<Body>) -> Result<Value, Error> {
        let response = self.get_response(req).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        if status.is_success() {
            return Ok(serde_json::from_slice(body.as_ref())?);
        }
        let level = error_response_level(status);
        if let Ok(as_str) = std::str::from_utf8(body.as_ref()) {
            log::log!(level, "Response status: {}, body: {}", status, as_str);
        } else {
            log::log!(
                level,
                "Response status: {}, binary body with {} bytes",
                status,
                body.len()
            );
        }
        Err(Error::http(status))
    }

    async fn get_response_lines_deserialized<T: DeserializeOwned>(
        &self,
        req: Request<Body>,
    ) -> Result<LineDeserializer<T>, Error> {
        let resp = self.get_response(req).await?;
        if !resp.status().is_success() {
            Err(Error::http(resp.status()))
        } else {
            Ok(LineDeserializer::new(Lines::from_body(resp.into_body())))
        }
    }

    async fn get_response_body<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        let response = self.get_response(req).await?;
        let status_code = response.status().as_u16();
        let result = Client::read_body(response).await;
        log::debug!(
            "Finished {} request to: {}, status: {}, total_duration: {}ms, success: {}",
            method,
            uri,
            status_code,
            start_time.elapsed().as_millis(),
            result.is_ok()
        );
        result
    }

    async fn get_response(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let start_time = Instant::now();
        log::debug!("Starting {} request to: {}", method, uri);

        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();
        let duration = start_time.elapsed().as_millis();
        match result {
            Ok(resp) => {
                log::debug!(
                    "Response status received for {} to: {}, status: {}, duration: {}ms",
                    method,
                    uri,
                    resp.status().as_u16(),
                    duration
                );
                Ok(resp)
            }
            Err(err) => {
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                Err(err.into())
            }
        }
    }

    async fn read_body<T: DeserializeOwned>(response: Response<Body>) -> Result<T, Error> {
        if !response.status().is_success() {
            return Err(Error::http(response.status()));
        }

        let deserialized = if log::log_enabled!(log::Level::Trace) {
            // logging the body means buffering all of it first
            let body = hyper::body::to_bytes(response.into_body()).await?;
            log::trace!("Got response body: {}", String::from_utf8_lossy(body.as_ref()));
            serde_json::from_slice(body.as_ref())?
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            serde_json::from_reader(body.reader())?
        };
        Ok(deserialized)
    }
}

/// Conflicts and missing objects are expected outcomes of optimistic writes, and are handled by
/// the reconciler, so they're only logged at debug level
fn error_response_level(status: http::StatusCode) -> log::Level {
    match status.as_u16() {
        404 | 409 => log::Level::Debug,
        _ => log::Level::Error,
    }
}

fn to_resource(value: Value) -> Result<K8sResource, StoreError> {
    K8sResource::from_value(value).map_err(StoreError::from)
}

fn id_of(resource: &Value) -> Result<ObjectIdRef<'_>, StoreError> {
    resource.get_id_ref().ok_or_else(|| {
        StoreError::Invalid(InvalidResourceError::new(
            "resource is missing metadata.name",
            resource.clone(),
        ))
    })
}

#[async_trait]
impl Store for Client {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<K8sResource, StoreError> {
        let value = self
            .get_resource(k8s_type, id)
            .await
            .map_err(|e| StoreError::from_client(e, id))?;
        to_resource(value)
    }

    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<Vec<K8sResource>, StoreError> {
        let list = self
            .list_all(k8s_type, namespace, None)
            .await
            .map_err(StoreError::Client)?;
        list.items.into_iter().map(to_resource).collect()
    }

    async fn create(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let id = id_of(resource)?;
        let created = self
            .create_resource(k8s_type, resource)
            .await
            .map_err(|e| StoreError::from_client(e, &id))?;
        to_resource(created)
    }

    async fn replace(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let replaced = self
            .replace_resource(k8s_type, id, resource)
            .await
            .map_err(|e| StoreError::from_client(e, id))?;
        to_resource(replaced)
    }

    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let updated = Client::update_status(self, k8s_type, id, resource)
            .await
            .map_err(|e| StoreError::from_client(e, id))?;
        to_resource(updated)
    }

    async fn delete(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>) -> Result<(), StoreError> {
        self.delete_resource(k8s_type, id)
            .await
            .map_err(|e| StoreError::from_client(e, id))
    }
}

/// Splits a streaming response body into lines, as used by watch responses, which contain one
/// json document per line
pub struct Lines {
    body: Body,
    remaining: Option<bytes::Bytes>,
    current_line: Vec<bytes::Bytes>,
}

impl Lines {
    pub fn from_body(body: Body) -> Lines {
        Lines {
            body,
            remaining: None,
            current_line: Vec::with_capacity(2),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Line<'_>, Error>> {
        self.current_line.clear();

        loop {
            if let Some(mut remaining) = self.remaining.take() {
                match Lines::index_of_newline(&remaining[..]) {
                    Some((start, end)) => {
                        let mut line = remaining.split_to(end);
                        if !remaining.is_empty() {
                            self.remaining = Some(remaining);
                        }
                        if start > 0 {
                            line.truncate(start);
                            self.current_line.push(line);
                        }
                        if !self.current_line.is_empty() {
                            return Some(Ok(self.make_line()));
                        }
                    }
                    None => self.current_line.push(remaining),
                }
            } else {
                match self.body.next().await {
                    Some(Ok(bytes)) => self.remaining = Some(bytes),
                    Some(Err(e)) => {
                        log::error!("Error reading response lines: {}", e);
                        return Some(Err(e.into()));
                    }
                    None if self.current_line.is_empty() => return None,
                    None => return Some(Ok(self.make_line())),
                }
            }
        }
    }

    fn make_line(&mut self) -> Line {
        Line {
            buffer: self.current_line.as_mut_slice(),
        }
    }

    fn index_of_newline(bytes: &[u8]) -> Option<(usize, usize)> {
        NEWLINE_REGEX.find(bytes).map(|m| (m.start(), m.end()))
    }
}

pub struct Line<'a> {
    buffer: &'a mut [bytes::Bytes],
}

impl<'a> Line<'a> {
    fn is_empty(&self) -> bool {
        self.buffer.iter().all(bytes::Bytes::is_empty)
    }
}

impl<'a> io::Read for Line<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bytes_written = 0;
        let mut dest = buf;

        while !self.buffer.is_empty() && !dest.is_empty() {
            let byte_count = dest.len().min(self.buffer[0].len());
            dest[..byte_count].copy_from_slice(&self.buffer[0][..byte_count]);
            bytes_written += byte_count;
            dest = &mut dest[byte_count..];
            self.buffer[0].advance(byte_count);
            if self.buffer[0].is_empty() {
                let tmp: &mut [bytes::Bytes] = std::mem::take(&mut self.buffer);
                self.buffer = &mut tmp[1..];
            }
        }
        Ok(bytes_written)
    }
}

/// Deserializes each non-empty line of a response as a `T`
pub struct LineDeserializer<T: DeserializeOwned> {
    lines: Lines,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> LineDeserializer<T> {
    pub fn new(lines: Lines) -> Self {
        Self {
            lines,
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        loop {
            match self.lines.next().await? {
                Ok(reader) if !reader.is_empty() => {
                    return Some(serde_json::from_reader(reader).map_err(Into::into))
                }
                Err(err) => return Some(Err(err)),
                _ => {}
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark(Value),
    Error(ApiError),
}

#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}
