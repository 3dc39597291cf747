//
// Verification-code delivery collaborators. The engine only ever asks
// "deliver this code to this address"; everything past that line is the
// dispatcher's problem.
//
use lettre::{
    message::Mailbox,
    transport::smtp::authentication::{Credentials, Mechanism},
    transport::smtp::client::{Tls, TlsParameters},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::{api::EmptyResult, http_client::make_http_request, CONFIG};

fn smtp_transport() -> Result<AsyncSmtpTransport<Tokio1Executor>, crate::error::Error> {
    let host = CONFIG.smtp_host().expect("smtp_transport called without SMTP_HOST");

    let mut builder = match CONFIG.smtp_security().as_str() {
        "force_tls" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
            .port(CONFIG.smtp_port())
            .tls(Tls::Wrapper(TlsParameters::new(host.clone())?)),
        "off" => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str()).port(CONFIG.smtp_port()),
        // starttls
        _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
            .port(CONFIG.smtp_port())
            .tls(Tls::Required(TlsParameters::new(host.clone())?)),
    };

    builder = builder.timeout(Some(std::time::Duration::from_secs(CONFIG.smtp_timeout())));

    if let (Some(user), Some(pass)) = (CONFIG.smtp_username(), CONFIG.smtp_password()) {
        builder = builder
            .credentials(Credentials::new(user, pass))
            .authentication(vec![Mechanism::Plain, Mechanism::Login]);
    }

    Ok(builder.build())
}

async fn send_email(to: &str, subject: &str, body: String) -> EmptyResult {
    if !CONFIG.smtp_enabled() {
        // No dispatcher wired up, surface the mail in the log instead
        info!("SMTP disabled, would have sent to {to}: {subject} / {body}");
        return Ok(());
    }

    let address = to.parse::<Address>()?;
    let from = CONFIG.smtp_from().parse::<Address>()?;

    let message = Message::builder()
        .from(Mailbox::new(Some(CONFIG.smtp_from_name()), from))
        .to(Mailbox::new(None, address))
        .subject(subject)
        .body(body)
        .map_err(|e| crate::error::Error::new(crate::error::ErrorKind::Internal, format!("Error building email: {e}")))?;

    smtp_transport()?.send(message).await?;
    Ok(())
}

pub async fn send_email_code(email: &str, code: &str) -> EmptyResult {
    let minutes = CONFIG.code_validity() / 60;
    send_email(
        email,
        "Your verification code",
        format!("Your verification code is {code}. It expires in {minutes} minutes."),
    )
    .await
}

/// Hands a phone code to the configured SMS relay. The relay owns carrier
/// selection, templating and localisation.
pub async fn send_sms_code(phone: &str, code: &str) -> EmptyResult {
    let Some(relay) = CONFIG.sms_relay_uri() else {
        info!("SMS relay disabled, would have sent code {code} to {phone}");
        return Ok(());
    };

    let mut request = make_http_request(reqwest::Method::POST, &relay)?.json(&json!({
        "to": phone,
        "code": code,
        "expires_in": CONFIG.code_validity(),
    }));

    if let Some(token) = CONFIG.sms_relay_token() {
        request = request.bearer_auth(token);
    }

    request.send().await?.error_for_status()?;
    Ok(())
}
