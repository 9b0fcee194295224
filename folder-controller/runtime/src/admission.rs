use crate::{
    core::validate,
    k8s::{
        ClusterFolder, ClusterFolderSpec, FolderIndex, FolderIndexSpec, NamespacedFolder,
        NamespacedFolderSpec,
    },
};
use ahash::AHashSet as HashSet;
use anyhow::{anyhow, bail, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Default)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

#[async_trait::async_trait]
trait Validate<T> {
    async fn validate(self, name: &str, spec: T) -> Result<()>;
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl AdmissionService ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(not_found()));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        // Removing a folder or the index cannot introduce a loop or a second
        // parent.
        if matches!(req.operation, Operation::Delete) {
            return AdmissionResponse::from(&req);
        }

        if is_kind::<FolderIndex>(&req) {
            return self.admit_spec::<FolderIndexSpec>(req).await;
        }

        if is_kind::<ClusterFolder>(&req) {
            return self.admit_spec::<ClusterFolderSpec>(req).await;
        }

        if is_kind::<NamespacedFolder>(&req) {
            return self.admit_spec::<NamespacedFolderSpec>(req).await;
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_spec<T>(self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);

        let kind = req.kind.kind.clone();
        let (obj, spec) = match parse_spec::<T>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse {} spec", kind);
                return rsp.deny(error);
            }
        };

        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        if let Err(error) = self.validate(&name, spec).await {
            info!(%error, %ns, %name, %kind, "Denied");
            return rsp.deny(error);
        }

        rsp
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn not_found() -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = http::StatusCode::NOT_FOUND;
    rsp
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    let mut rsp = Response::new(Body::from(bytes));
    rsp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}

#[async_trait::async_trait]
impl Validate<FolderIndexSpec> for Admission {
    async fn validate(self, _name: &str, spec: FolderIndexSpec) -> Result<()> {
        validate::validate(&spec)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Validate<ClusterFolderSpec> for Admission {
    async fn validate(self, name: &str, spec: ClusterFolderSpec) -> Result<()> {
        validate_declared(
            name,
            ("childClusterFolders", &spec.child_cluster_folders),
            ("namespaces", &spec.namespaces),
        )
    }
}

#[async_trait::async_trait]
impl Validate<NamespacedFolderSpec> for Admission {
    async fn validate(self, name: &str, spec: NamespacedFolderSpec) -> Result<()> {
        validate_declared(
            name,
            ("childNamespacedFolders", &spec.child_namespaced_folders),
            ("virtualMachines", &spec.virtual_machines),
        )
    }
}

/// Rejects a folder that lists itself as a child, or that lists any entry
/// twice.
fn validate_declared(
    name: &str,
    (children_field, children): (&str, &[String]),
    (leaves_field, leaves): (&str, &[String]),
) -> Result<()> {
    if children.iter().any(|c| c == name) {
        bail!("folder {name} cannot be its own child");
    }

    for (field, entries) in [(children_field, children), (leaves_field, leaves)] {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry) {
                bail!("{field} lists {entry} more than once");
            }
        }
    }

    Ok(())
}
