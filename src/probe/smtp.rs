use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, Tokio1Executor};
use std::time::Duration;

use crate::types::ServerSettings;

/// Build an authenticated transport for `settings`. Implicit TLS when
/// `tls` is set, otherwise STARTTLS is required.
pub fn transport(
    settings: &ServerSettings,
    timeout: Duration,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
    let params = TlsParameters::builder(settings.host.clone())
        .dangerous_accept_invalid_certs(settings.ignore_certificate)
        .dangerous_accept_invalid_hostnames(settings.ignore_certificate)
        .build()
        .map_err(|e| format!("tls config: {}", e))?;
    let tls = if settings.tls {
        Tls::Wrapper(params)
    } else {
        Tls::Required(params)
    };

    Ok(
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(settings.host.as_str())
            .port(settings.port)
            .tls(tls)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(timeout))
            .build(),
    )
}

/// Connect and authenticate once
pub async fn verify(settings: &ServerSettings, timeout: Duration) -> Result<(), String> {
    let transport = transport(settings, timeout)?;
    match transport.test_connection().await {
        Ok(true) => Ok(()),
        Ok(false) => Err("smtp server did not accept the connection".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
