//! Resolves the `ProviderConfig` referenced by a managed resource into the
//! options of a Bitbucket client.

use std::{collections::BTreeMap, time::Duration};

use anyhow::anyhow;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, Patch, PatchParams},
};
use provider_bitbucket_apis::{
    CredentialsSource, ManagedResource, PROVIDER_CONFIG_LABEL, ProviderConfig,
    ProviderConfigReference, ProviderConfigSpec, ProviderConfigUsage, ProviderConfigUsageSpec,
    SecretKeySelector, TypedReference,
};

use crate::{
    MANAGER,
    bitbucket::{self, ClientOpts},
    errors::{ControllerError, ExtKubeApiError},
};

const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the Bitbucket client options for `mg` from its `ProviderConfig`.
pub(crate) async fn get_config<K>(client: &Client, mg: &K) -> Result<ClientOpts, ControllerError>
where
    K: ManagedResource,
{
    match mg.provider_config_name() {
        Some(name) => use_provider_config(client, mg, name).await,
        None => Err(ControllerError::ProviderConfig(
            "providerConfigRef is not given".to_string(),
        )),
    }
}

async fn use_provider_config<K>(
    client: &Client,
    mg: &K,
    name: &str,
) -> Result<ClientOpts, ControllerError>
where
    K: ManagedResource,
{
    let pc = match Api::<ProviderConfig>::all(client.clone()).get(name).await {
        Ok(pc) => pc,
        Err(e) if e.is_not_found() => {
            return Err(ControllerError::ProviderConfig(format!(
                "cannot get referenced Provider: {}",
                e
            )));
        }
        Err(e) => return Err(anyhow!("cannot get referenced Provider: {}", e).into()),
    };

    track_usage(client, mg, name)
        .await
        .map_err(|e| anyhow!("cannot track ProviderConfig usage: {}", e))?;

    let selector = credentials_secret_ref(&pc.spec)?;
    let token = get_secret(client, selector).await?;
    client_opts(&pc.spec, token)
}

/// The secret holding the token, only secret based credentials are
/// supported.
pub(crate) fn credentials_secret_ref(
    spec: &ProviderConfigSpec,
) -> Result<&SecretKeySelector, ControllerError> {
    let source = spec.credentials.source;
    if source != CredentialsSource::Secret {
        return Err(ControllerError::ProviderConfig(format!(
            "credentials source {} is not currently supported",
            source
        )));
    }
    spec.credentials.secret_ref.as_ref().ok_or_else(|| {
        ControllerError::ProviderConfig("no credentials secret referenced".to_string())
    })
}

async fn get_secret(client: &Client, selector: &SecretKeySelector) -> Result<String, ControllerError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &selector.namespace);
    match secrets.get(&selector.name).await {
        Ok(secret) => secret_value(&secret, selector),
        Err(e) if e.is_not_found() => Err(ControllerError::ProviderConfig(format!(
            "cannot get credentials secret {}/{}: {}",
            selector.namespace, selector.name, e
        ))),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn secret_value(
    secret: &Secret,
    selector: &SecretKeySelector,
) -> Result<String, ControllerError> {
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&selector.key))
        .ok_or_else(|| {
            ControllerError::ProviderConfig(format!(
                "key {} not found in secret {}/{}",
                selector.key, selector.namespace, selector.name
            ))
        })?;
    let token = std::str::from_utf8(&value.0).map_err(|e| {
        ControllerError::ProviderConfig(format!(
            "key {} of secret {}/{} is not valid UTF-8: {}",
            selector.key, selector.namespace, selector.name, e
        ))
    })?;
    Ok(token.trim_end().to_string())
}

pub(crate) fn client_opts(
    spec: &ProviderConfigSpec,
    token: String,
) -> Result<ClientOpts, ControllerError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(DEFAULT_CONNECTION_TIMEOUT)
        .timeout(DEFAULT_CONNECTION_TIMEOUT + DEFAULT_RESPONSE_TIMEOUT)
        .connection_verbose(spec.verbose());
    if spec.insecure() {
        builder = builder
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(DEFAULT_MAX_IDLE_CONNECTIONS);
    }
    let http_client = builder.build().map_err(bitbucket::Error::from)?;
    Ok(ClientOpts {
        api_base_url: spec.api_url.clone(),
        token,
        username: spec.username.clone(),
        verbose: spec.verbose(),
        http_client: Some(http_client),
    })
}

/// The usage record of `mg`, named after its UID and owned by it.
pub(crate) fn usage_for<K>(mg: &K, provider_config: &str) -> Result<ProviderConfigUsage, ControllerError>
where
    K: ManagedResource,
{
    let uid = mg
        .uid()
        .ok_or_else(|| anyhow!("{} {} has no uid", K::kind(&()), mg.name_any()))?;
    let mut usage = ProviderConfigUsage::new(
        &uid,
        ProviderConfigUsageSpec {
            provider_config_ref: ProviderConfigReference {
                name: provider_config.to_string(),
            },
            resource_ref: TypedReference {
                api_version: K::api_version(&()).to_string(),
                kind: K::kind(&()).to_string(),
                name: mg.name_any(),
                uid: Some(uid.clone()),
            },
        },
    );
    usage.metadata.labels = Some(BTreeMap::from([(
        PROVIDER_CONFIG_LABEL.to_string(),
        provider_config.to_string(),
    )]));
    usage.metadata.owner_references = mg.controller_owner_ref(&()).map(|o| vec![o]);
    Ok(usage)
}

async fn track_usage<K>(client: &Client, mg: &K, provider_config: &str) -> Result<(), ControllerError>
where
    K: ManagedResource,
{
    let usage = usage_for(mg, provider_config)?;
    let api = Api::<ProviderConfigUsage>::all(client.clone());
    api.patch(
        &usage.name_any(),
        &PatchParams::apply(MANAGER).force(),
        &Patch::Apply(&usage),
    )
    .await?;
    Ok(())
}

/// Remove the usage record of `mg`, succeeds if there is none.
pub(crate) async fn untrack_usage<K>(client: &Client, mg: &K) -> Result<(), ControllerError>
where
    K: ManagedResource,
{
    let Some(uid) = mg.uid() else {
        return Ok(());
    };
    let api = Api::<ProviderConfigUsage>::all(client.clone());
    match api.delete(&uid, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use provider_bitbucket_apis::{Credentials, Repo, RepoSpec, ResourceSpec};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROVIDER_CONFIG_PATH: &str = "/apis/bitbucket.krateo.io/v1alpha1/providerconfigs/default";

    /// A Kubernetes client talking to `server`.
    pub(crate) fn kube_client(server: &MockServer) -> Client {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = kube::Config::new(server.uri().parse().unwrap());
        Client::try_from(config).unwrap()
    }

    /// Serves the `default` ProviderConfig pointing back at `server`, its
    /// token secret and the usage record of `mg`. Each is expected once.
    pub(crate) async fn mount_provider_config<K: ManagedResource>(server: &MockServer, mg: &K) {
        Mock::given(method("GET"))
            .and(path(PROVIDER_CONFIG_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "bitbucket.krateo.io/v1alpha1",
                "kind": "ProviderConfig",
                "metadata": {"name": "default"},
                "spec": {
                    "apiUrl": server.uri(),
                    "credentials": {
                        "source": "Secret",
                        "secretRef": {
                            "namespace": "krateo-system",
                            "name": "bitbucket",
                            "key": "token"
                        }
                    }
                }
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!(
                "/apis/bitbucket.krateo.io/v1alpha1/providerconfigusages/{}",
                mg.uid().unwrap()
            )))
            .and(header("content-type", "application/apply-patch+yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_json(usage_for(mg, "default").unwrap()))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/krateo-system/secrets/bitbucket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "bitbucket", "namespace": "krateo-system"},
                // t0k3n followed by a newline
                "data": {"token": "dDBrM24K"}
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    fn status(code: u16, reason: &str) -> ResponseTemplate {
        ResponseTemplate::new(code).set_body_json(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": reason.to_lowercase(),
            "reason": reason,
            "code": code
        }))
    }

    fn repo_using_default() -> Repo {
        Repo {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                uid: Some("6b1c8a2e-1d4f-4c1e-9d59-0c1a3f3b6a10".to_string()),
                ..Default::default()
            },
            spec: RepoSpec {
                resource_spec: ResourceSpec {
                    provider_config_ref: Some(ProviderConfigReference {
                        name: "default".to_string(),
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    fn spec(source: CredentialsSource, secret_ref: Option<SecretKeySelector>) -> ProviderConfigSpec {
        ProviderConfigSpec {
            api_url: "https://bitbucket.example.org".to_string(),
            credentials: Credentials { source, secret_ref },
            ..Default::default()
        }
    }

    fn selector() -> SecretKeySelector {
        SecretKeySelector {
            namespace: "krateo-system".to_string(),
            name: "bitbucket".to_string(),
            key: "token".to_string(),
        }
    }

    #[test]
    fn only_secret_credentials_are_supported() {
        let err = credentials_secret_ref(&spec(CredentialsSource::Environment, None)).unwrap_err();
        assert_eq!(
            "credentials source Environment is not currently supported",
            err.to_string()
        );
        let err = credentials_secret_ref(&spec(CredentialsSource::Secret, None)).unwrap_err();
        assert_eq!("no credentials secret referenced", err.to_string());
        assert!(!err.is_temporary());

        let s = spec(CredentialsSource::Secret, Some(selector()));
        assert_eq!(&selector(), credentials_secret_ref(&s).unwrap());
    }

    #[test]
    fn token_from_secret() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(b"MjgOiJ9rQ==\n".to_vec()),
            )])),
            ..Default::default()
        };
        assert_eq!("MjgOiJ9rQ==", secret_value(&secret, &selector()).unwrap());

        let mut other_key = selector();
        other_key.key = "password".to_string();
        assert_eq!(
            "key password not found in secret krateo-system/bitbucket",
            secret_value(&secret, &other_key).unwrap_err().to_string()
        );
        assert!(secret_value(&Secret::default(), &selector()).is_err());
    }

    #[test]
    fn client_options() {
        let mut s = spec(CredentialsSource::Secret, Some(selector()));
        s.insecure = Some(true);
        s.verbose = Some(true);
        s.username = Some("admin".to_string());
        let opts = client_opts(&s, "t0k3n".to_string()).unwrap();
        assert_eq!("https://bitbucket.example.org", opts.api_base_url);
        assert_eq!("t0k3n", opts.token);
        assert_eq!(Some("admin".to_string()), opts.username);
        assert!(opts.verbose);
        assert!(opts.http_client.is_some());
    }

    #[test]
    fn usage_is_owned_by_managed_resource() {
        let repo = Repo {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                uid: Some("6b1c8a2e-1d4f-4c1e-9d59-0c1a3f3b6a10".to_string()),
                ..Default::default()
            },
            spec: RepoSpec::default(),
            status: None,
        };
        let usage = usage_for(&repo, "default").unwrap();
        assert_eq!(Some("6b1c8a2e-1d4f-4c1e-9d59-0c1a3f3b6a10"), usage.metadata.name.as_deref());
        assert_eq!("default", usage.metadata.labels.as_ref().unwrap()[PROVIDER_CONFIG_LABEL]);
        assert_eq!("Repo", usage.spec.resource_ref.kind);
        assert_eq!("bitbucket.krateo.io/v1alpha1", usage.spec.resource_ref.api_version);
        let owner = &usage.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!("demo", owner.name);
        assert_eq!(Some(true), owner.controller);

        let no_uid = Repo::new("demo", RepoSpec::default());
        assert!(usage_for(&no_uid, "default").is_err());
    }

    #[tokio::test]
    async fn config_from_provider_config_and_secret() {
        let server = MockServer::start().await;
        let repo = repo_using_default();
        mount_provider_config(&server, &repo).await;

        let opts = get_config(&kube_client(&server), &repo).await.unwrap();
        assert_eq!(server.uri(), opts.api_base_url);
        assert_eq!("t0k3n", opts.token);
        assert_eq!(None, opts.username);
        assert!(!opts.verbose);
        assert!(opts.http_client.is_some());
    }

    #[tokio::test]
    async fn missing_provider_config_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PROVIDER_CONFIG_PATH))
            .respond_with(status(404, "NotFound"))
            .expect(1)
            .mount(&server)
            .await;

        let err = get_config(&kube_client(&server), &repo_using_default())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("cannot get referenced Provider: "));
        assert!(!err.is_temporary());
        // No usage is tracked for a config that does not exist.
        assert_eq!(1, server.received_requests().await.unwrap().len());
    }

    #[tokio::test]
    async fn failing_api_server_is_temporary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PROVIDER_CONFIG_PATH))
            .respond_with(status(500, "InternalError"))
            .mount(&server)
            .await;

        let err = get_config(&kube_client(&server), &repo_using_default())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("cannot get referenced Provider: "));
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn missing_secret_is_permanent() {
        let server = MockServer::start().await;
        let repo = repo_using_default();
        Mock::given(method("GET"))
            .and(path(PROVIDER_CONFIG_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(ProviderConfig::new(
                "default",
                spec(CredentialsSource::Secret, Some(selector())),
            )))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200).set_body_json(usage_for(&repo, "default").unwrap()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/krateo-system/secrets/bitbucket"))
            .respond_with(status(404, "NotFound"))
            .mount(&server)
            .await;

        let err = get_config(&kube_client(&server), &repo).await.unwrap_err();
        assert!(
            err.to_string()
                .starts_with("cannot get credentials secret krateo-system/bitbucket: ")
        );
        assert!(!err.is_temporary());
    }
}
