use crate::constants::*;

/// Runtime configuration, read once from the process environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: String,
    pub data_path: String,
    pub session_secret: String,
    pub frontend_origin: String,
    pub production: bool,
    pub stripe: Option<StripeConfig>,
    pub smtp: Option<SmtpConfig>,
}

#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: String,
    pub price_id: String,
    pub api_base: String,
}

/// Outgoing mail server for password reset messages.
#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: String,
    pub from: String,
    pub use_tls: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let host = std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = std::env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
        let data_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string());
        let session_secret =
            std::env::var("SESSION_SECRET").map_err(|_| "SESSION_SECRET is required")?;
        let frontend_origin = std::env::var("FRONTEND_ORIGIN")
            .unwrap_or_else(|_| DEFAULT_FRONTEND_ORIGIN.to_string());
        let production = std::env::var("PRODUCTION")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(false);

        let stripe = match std::env::var("STRIPE_SECRET_KEY") {
            Ok(secret_key) if !secret_key.trim().is_empty() => {
                let price_id = std::env::var("STRIPE_PRICE_ID").map_err(|_| {
                    "STRIPE_PRICE_ID is required when STRIPE_SECRET_KEY is set".to_string()
                })?;
                let api_base = std::env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| DEFAULT_STRIPE_API_BASE.to_string());
                Some(StripeConfig {
                    secret_key,
                    price_id,
                    api_base,
                })
            }
            _ => None,
        };

        let smtp = match std::env::var("SMTP_HOST") {
            Ok(host) if !host.trim().is_empty() => {
                let from = std::env::var("SMTP_FROM")
                    .map_err(|_| "SMTP_FROM is required when SMTP_HOST is set".to_string())?;
                let port = match std::env::var("SMTP_PORT") {
                    Ok(port) => port
                        .parse::<u16>()
                        .map_err(|_| format!("SMTP_PORT '{}' is not a valid port number", port))?,
                    Err(_) => DEFAULT_SMTP_PORT,
                };
                let username = std::env::var("SMTP_USER")
                    .ok()
                    .filter(|user| !user.trim().is_empty());
                let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
                let use_tls = std::env::var("SMTP_TLS")
                    .map(|val| val.to_lowercase() != "false")
                    .unwrap_or(true);
                Some(SmtpConfig {
                    host,
                    port,
                    username,
                    password,
                    from,
                    use_tls,
                })
            }
            _ => None,
        };

        let config = Self {
            host,
            port,
            data_path,
            session_secret,
            frontend_origin,
            production,
            stripe,
            smtp,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.session_secret.len() < MIN_SESSION_SECRET_LENGTH {
            return Err(format!(
                "SESSION_SECRET must be at least {} characters",
                MIN_SESSION_SECRET_LENGTH
            ));
        }
        if self.port.parse::<u16>().is_err() {
            return Err(format!("PORT '{}' is not a valid port number", self.port));
        }
        if let Some(smtp) = &self.smtp {
            if !smtp.from.contains('@') {
                return Err(format!("SMTP_FROM '{}' is not an email address", smtp.from));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
