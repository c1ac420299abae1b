// Server configuration
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: &str = "3000";
pub const DEFAULT_DATA_PATH: &str = "data";
pub const DEFAULT_FRONTEND_ORIGIN: &str = "http://localhost:8080";
pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;

// Session configuration
pub const SESSION_NAME: &str = "saldus_session";
pub const SESSION_EXPIRY_DAYS: i64 = 30;
pub const MIN_SESSION_SECRET_LENGTH: usize = 64;
pub const SESSION_USER_KEY: &str = "user";

// Database limits and defaults
pub const DEFAULT_CLIENTS_LIMIT: u32 = 100;
pub const DEFAULT_TRANSACTIONS_LIMIT: u32 = 500;
pub const MAX_LIMIT: u32 = 1000;
pub const MAX_OFFSET: u32 = 1_000_000;
pub const DASHBOARD_RECENT_TRANSACTIONS: u32 = 5;

// Validation limits
pub const MAX_CATEGORY_LENGTH: usize = 100;
pub const MAX_DESCRIPTION_LENGTH: usize = 255;
pub const MAX_CLIENT_NAME_LENGTH: usize = 255;
pub const MAX_EMAIL_LENGTH: usize = 254;
pub const MAX_PHONE_LENGTH: usize = 50;
pub const MAX_SEARCH_TERM_LENGTH: usize = 100;
pub const MAX_FULL_NAME_LENGTH: usize = 100;
pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const MAX_ANSWER_LENGTH: usize = 100;

// Plan gating
pub const FREE_WEEKLY_LIMIT: u32 = 5;
pub const WEEKLY_WINDOW_SECONDS: i64 = 7 * 24 * 60 * 60;
pub const FREE_REPORT_MONTHS: u32 = 6;
pub const PRO_REPORT_MONTHS: u32 = 12;
pub const TOP_CATEGORIES: usize = 6;
pub const TOP_MONTHS: usize = 3;
pub const MAX_RECOMMENDATIONS: usize = 6;
pub const MIN_SPECIFIC_RECOMMENDATIONS: usize = 3;
pub const UNCATEGORIZED_LABEL: &str = "Other";

// Subscription resolver
pub const SUBSCRIPTION_STALE_SECONDS: i64 = 5 * 60;
pub const SUBSCRIPTION_POLL_SECONDS: u64 = 5 * 60;
pub const SUBSCRIPTION_IDLE_SECONDS: i64 = 30 * 60;
pub const CHECKOUT_REFRESH_DELAY_MS: u64 = 2_000;
pub const MAX_TRACKED_SUBSCRIPTIONS: usize = 1000;
pub const CHECKOUT_SUCCESS: &str = "success";
pub const CHECKOUT_CANCELLED: &str = "cancelled";

// Password recovery
pub const RECOVERY_COOLDOWN_SECONDS: i64 = 60 * 60;
pub const RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
pub const REQUIRED_FAKE_ANSWERS: usize = 3;
pub const RESET_EMAIL_SUBJECT: &str = "Reset your Saldus password";
pub const SECURITY_QUESTIONS: [&str; 5] = [
    "What was the name of your first pet?",
    "In which city were you born?",
    "What is your mother's maiden name?",
    "What was your first job?",
    "What was the name of the last school you attended?",
];

// Error messages
pub const ERR_DATABASE_OPERATION: &str = "Database operation failed";
pub const ERR_INVALID_SESSION: &str = "Invalid session";
pub const ERR_UNAUTHORIZED: &str = "Not logged in";
pub const ERR_PRO_REQUIRED: &str = "This feature requires the Pro plan";
