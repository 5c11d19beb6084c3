//! SASL authentication for freshly opened sockets. The handshake is:
//! list mechanisms, pick PLAIN (or the first offered), send the
//! credentials, and step through any continuation the server asks for.

use std::time::Duration;

use crate::connection::Connection;
use crate::error::Error;
use crate::pool::Socket;
use crate::protocol::{Operation, ProtocolCodec, Status};

/// Upper bound on SaslStep exchanges. PLAIN finishes in one; anything
/// still continuing after this many steps is not going to converge.
pub(crate) const MAX_SASL_STEPS: usize = 8;

/// Credentials for the SASL handshake, applied to every new socket.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// Force a specific mechanism instead of negotiating one. The server
    /// must offer it.
    pub mechanism: Option<String>,
}

impl AuthConfig {
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mechanism: None,
        }
    }

    fn payload(&self) -> Vec<u8> {
        format!("\0{}\0{}", self.username, self.password).into_bytes()
    }
}

/// Run the handshake on a fresh socket. Any failure fails socket creation;
/// the node itself stays alive, since refusing credentials is not a node
/// fault.
pub(crate) async fn authenticate<C: Connection>(
    socket: &mut Socket<C>,
    codec: &dyn ProtocolCodec,
    auth: &AuthConfig,
    receive_timeout: Duration,
) -> Result<(), Error> {
    let list = socket
        .roundtrip(codec, &Operation::sasl_list(), receive_timeout)
        .await?;
    list.error_for_status()
        .map_err(|status| Error::Auth(format!("listing mechanisms failed: {}", status)))?;

    let offered = String::from_utf8_lossy(&list.value).into_owned();
    let mechanism = choose_mechanism(&offered, auth.mechanism.as_deref())?;

    let mut response = socket
        .roundtrip(
            codec,
            &Operation::sasl_auth(&mechanism, auth.payload()),
            receive_timeout,
        )
        .await?;

    for _ in 0..MAX_SASL_STEPS {
        match response.status {
            Status::NoError => return Ok(()),
            Status::AuthContinue => {
                response = socket
                    .roundtrip(
                        codec,
                        &Operation::sasl_step(&mechanism, auth.payload()),
                        receive_timeout,
                    )
                    .await?;
            }
            status => return Err(Error::Auth(status.to_string())),
        }
    }
    Err(Error::Auth(format!(
        "handshake did not converge within {} steps",
        MAX_SASL_STEPS
    )))
}

fn choose_mechanism(offered: &str, requested: Option<&str>) -> Result<String, Error> {
    let mut mechanisms = offered.split_whitespace();
    match requested {
        Some(want) => mechanisms
            .find(|m| m.eq_ignore_ascii_case(want))
            .map(str::to_owned)
            .ok_or_else(|| Error::Auth(format!("server does not offer {}", want))),
        None => offered
            .split_whitespace()
            .find(|m| m.eq_ignore_ascii_case("PLAIN"))
            .or_else(|| mechanisms.next())
            .map(str::to_owned)
            .ok_or_else(|| Error::Auth("server offered no mechanisms".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_plain() {
        assert_eq!(
            "PLAIN",
            choose_mechanism("CRAM-MD5 PLAIN", None).unwrap()
        );
    }

    #[test]
    fn falls_back_to_first_offered() {
        assert_eq!(
            "CRAM-MD5",
            choose_mechanism("CRAM-MD5 SCRAM-SHA-1", None).unwrap()
        );
    }

    #[test]
    fn honors_an_explicit_mechanism() {
        assert_eq!(
            "CRAM-MD5",
            choose_mechanism("CRAM-MD5 PLAIN", Some("cram-md5")).unwrap()
        );
        assert!(choose_mechanism("PLAIN", Some("SCRAM-SHA-1")).is_err());
    }

    #[test]
    fn rejects_an_empty_offer() {
        assert!(choose_mechanism("", None).is_err());
    }

    #[test]
    fn plain_payload_shape() {
        let auth = AuthConfig::plain("user", "secret");
        assert_eq!(b"\0user\0secret".to_vec(), auth.payload());
    }
}
