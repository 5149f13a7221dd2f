use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::tls::client_config;
use crate::types::ServerSettings;

/// Connect, log in and log out once. Errors are returned as text so the
/// caller can classify them.
pub async fn login_round_trip(settings: &ServerSettings) -> Result<(), String> {
    let tcp = connect_tcp(&settings.host, settings.port).await?;

    if settings.tls {
        let config = client_config(settings.ignore_certificate)
            .map_err(|e| format!("tls config: {}", e))?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(settings.host.clone())
            .map_err(|_| format!("host not found: invalid hostname {}", settings.host))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| format!("tls handshake: {}", e))?;
        login(stream, settings).await
    } else {
        login(tcp, settings).await
    }
}

pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, String> {
    let addr = lookup_host((host, port))
        .await
        .map_err(|e| format!("host not found ({}): {}", host, e))?
        .next()
        .ok_or_else(|| format!("host not found ({}): no addresses", host))?;

    TcpStream::connect(addr)
        .await
        .map_err(|e| format!("tcp connect to {}: {}", addr, e))
}

async fn login<T>(stream: T, settings: &ServerSettings) -> Result<(), String>
where
    T: AsyncRead + AsyncWrite + Unpin + std::fmt::Debug + Send,
{
    let client = async_imap::Client::new(stream);
    let mut session = client
        .login(&settings.username, &settings.password)
        .await
        .map_err(|(e, _)| describe_login_error(e))?;
    debug!(host = %settings.host, "IMAP login accepted");

    // A failed logout does not invalidate the probe
    if let Err(e) = session.logout().await {
        debug!("IMAP logout failed: {}", e);
    }
    Ok(())
}

/// Only a server verdict counts as a rejected login. Transport failures
/// keep their own text so they classify on their own merits.
fn describe_login_error(error: async_imap::error::Error) -> String {
    match error {
        async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
            format!("login failed: {}", error)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::classify_error;
    use crate::types::ErrorCode;

    #[tokio::test]
    async fn test_refused_port_is_classified() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port,
            tls: true,
            username: "u".to_string(),
            password: "p".to_string(),
            ignore_certificate: false,
        };
        let err = login_round_trip(&settings).await.unwrap_err();
        assert_eq!(classify_error(&err), ErrorCode::ConnectionRefused);
    }

    #[test]
    fn test_only_server_rejection_is_auth_failure() {
        let rejected = describe_login_error(async_imap::error::Error::No(
            "[AUTHENTICATIONFAILED] Invalid credentials".to_string(),
        ));
        assert_eq!(classify_error(&rejected), ErrorCode::AuthFailure);

        let reset = describe_login_error(async_imap::error::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "Connection reset by peer (os error 104)",
        )));
        assert_eq!(classify_error(&reset), ErrorCode::Unknown);

        let lost = describe_login_error(async_imap::error::Error::ConnectionLost);
        assert_ne!(classify_error(&lost), ErrorCode::AuthFailure);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_not_auth_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            username: "u".to_string(),
            password: "p".to_string(),
            ignore_certificate: false,
        };
        let err = login_round_trip(&settings).await.unwrap_err();
        assert_ne!(classify_error(&err), ErrorCode::AuthFailure, "{}", err);
    }
}
