use super::{FactoryApi, OnlineKeysRequest, RootUpdate, TxInitRequest, TxInitResponse, TxPut, TxState};
use crate::error::{TufError, NON_FATAL_HTTP_STATUSES};
use crate::signature::KeyType;
use crate::tuf::{Role, SignedRoot, TargetsManifests};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Header carrying the API token.
pub const TOKEN_HEADER: &str = "OSF-TOKEN";

type HttpResult = Result<ureq::http::Response<ureq::Body>, ureq::Error>;

/// [`FactoryApi`] over HTTPS.
pub struct HttpFactoryApi {
    base_url: String,
    token: String,
    client: ureq::Agent,
}

impl HttpFactoryApi {
    /// * `server_url` - API server without trailing slash
    /// * `factory` - Factory name
    /// * `token` - API token with the `targets:read-update` scope
    pub fn new(server_url: &str, factory: &str, token: &str) -> Self {
        // Return a Response for every status so error bodies can be read
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            base_url: format!(
                "{}/ota/factories/{}",
                server_url.trim_end_matches('/'),
                factory
            ),
            token: token.to_string(),
            client: agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> Result<(u16, String), TufError> {
        log::debug!("GET {}", path);
        let response = self
            .client
            .get(&self.url(path))
            .header(TOKEN_HEADER, self.token.as_str())
            .call();
        read_response(response, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TufError> {
        let (status, body) = self.get(path)?;
        let body = check_status(status, body)?;
        serde_json::from_str(&body)
            .map_err(|e| TufError::ParseError(format!("Unexpected response from {}: {}", path, e)))
    }

    fn post<B: Serialize>(&self, path: &str, body: Option<&B>) -> Result<String, TufError> {
        log::debug!("POST {}", path);
        let request = self
            .client
            .post(&self.url(path))
            .header(TOKEN_HEADER, self.token.as_str());
        let response = match body {
            Some(body) => request
                .header("Content-Type", "application/json")
                .send(serde_json::to_vec(body)?.as_slice()),
            None => request.send_empty(),
        };
        let (status, body) = read_response(response, path)?;
        check_status(status, body)
    }

    fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<String, TufError> {
        log::debug!("PUT {}", path);
        let response = self
            .client
            .put(&self.url(path))
            .header(TOKEN_HEADER, self.token.as_str())
            .header("Content-Type", "application/json")
            .send(serde_json::to_vec(body)?.as_slice());
        let (status, body) = read_response(response, path)?;
        check_status(status, body)
    }

    fn delete(&self, path: &str) -> Result<String, TufError> {
        log::debug!("DELETE {}", path);
        let response = self
            .client
            .delete(&self.url(path))
            .header(TOKEN_HEADER, self.token.as_str())
            .call();
        let (status, body) = read_response(response, path)?;
        check_status(status, body)
    }
}

fn read_response(response: HttpResult, what: &str) -> Result<(u16, String), TufError> {
    let response =
        response.map_err(|e| TufError::Transport(format!("Request to {} failed: {}", what, e)))?;
    let status = response.status().as_u16();
    let body = response
        .into_body()
        .read_to_string()
        .map_err(|e| TufError::Transport(format!("Failed to read response from {}: {}", what, e)))?;
    Ok((status, body))
}

/// Map a response status to the error taxonomy, passing 2xx bodies through.
pub(crate) fn check_status(status: u16, body: String) -> Result<String, TufError> {
    match status {
        200..=299 => Ok(body),
        409 => Err(TufError::Conflict(body)),
        s if NON_FATAL_HTTP_STATUSES.contains(&s) => Err(TufError::Validation {
            status: s,
            message: body,
        }),
        s => Err(TufError::Transport(format!("HTTP {}: {}", s, body))),
    }
}

impl FactoryApi for HttpFactoryApi {
    fn get_ci_root(&self, version: Option<u64>) -> Result<SignedRoot, TufError> {
        match version {
            Some(v) => self.get_json(&format!("/root/{}.root.json", v)),
            None => self.get_json("/root/"),
        }
    }

    fn get_prod_root(&self) -> Result<Option<SignedRoot>, TufError> {
        let (status, body) = self.get("/root/?production=1")?;
        if status == 404 {
            return Ok(None);
        }
        let body = check_status(status, body)?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    fn post_root(&self, update: &RootUpdate) -> Result<(), TufError> {
        match self.post("/root/", Some(update)) {
            Err(TufError::Conflict(_)) => Err(TufError::ProdOutOfSync),
            other => other.map(|_| ()),
        }
    }

    fn tx_init(&self, message: &str) -> Result<String, TufError> {
        let body = TxInitRequest {
            message: message.to_string(),
        };
        let resp = match self.post("/tuf-updates/", Some(&body)) {
            Err(TufError::Conflict(msg)) => {
                return Err(TufError::Conflict(format!(
                    "A TUF root transaction is already active for this Factory: {}",
                    msg
                )))
            }
            other => other?,
        };
        let resp: TxInitResponse = serde_json::from_str(&resp)?;
        Ok(resp.txid)
    }

    fn tx_get(&self, txid: &str) -> Result<TxState, TufError> {
        self.get_json(&format!("/tuf-updates/{}", txid))
    }

    fn tx_put(&self, txid: &str, update: &TxPut) -> Result<(), TufError> {
        self.put(&format!("/tuf-updates/{}", txid), update)
            .map(|_| ())
    }

    fn tx_apply(&self, txid: &str) -> Result<(), TufError> {
        self.post::<()>(&format!("/tuf-updates/{}/apply", txid), None)
            .map(|_| ())
    }

    fn tx_cancel(&self, txid: &str) -> Result<(), TufError> {
        self.delete(&format!("/tuf-updates/{}", txid)).map(|_| ())
    }

    fn tx_generate_online_keys(
        &self,
        txid: &str,
        key_type: KeyType,
        roles: &[Role],
    ) -> Result<(), TufError> {
        let body = OnlineKeysRequest {
            key_type: key_type.name().to_string(),
            roles: roles.iter().map(|r| r.name().to_string()).collect(),
        };
        self.post(&format!("/tuf-updates/{}/online-keys", txid), Some(&body))
            .map(|_| ())
    }

    fn get_prod_targets(&self) -> Result<TargetsManifests, TufError> {
        self.get_json("/prod-targets/")
    }

    fn get_wave_targets(&self) -> Result<TargetsManifests, TufError> {
        self.get_json("/wave-targets/")
    }
}
