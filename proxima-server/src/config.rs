use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Postgres URL. When unset the server runs on the in-memory store.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_ttl")]
    pub jwt_ttl_secs: i64,
    #[serde(default = "default_password_min_len")]
    pub password_min_len: usize,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocationConfig {
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
    #[serde(default = "default_max_radius_km")]
    pub max_radius_km: f64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_nearby_limit")]
    pub nearby_limit: usize,
    #[serde(default = "default_grid_cell_deg")]
    pub grid_cell_deg: f64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagingConfig {
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

fn default_port() -> u16 { 3000 }
fn default_db_pool_size() -> u32 { 10 }
fn default_jwt_secret() -> String { "development-secret-change-in-production".into() }
fn default_jwt_ttl() -> i64 { 7 * 24 * 3600 }
fn default_password_min_len() -> usize { 8 }
fn default_radius_km() -> f64 { 5.0 }
fn default_max_radius_km() -> f64 { 50.0 }
fn default_ttl_secs() -> i64 { 15 * 60 }
fn default_nearby_limit() -> usize { 100 }
fn default_grid_cell_deg() -> f64 { 0.05 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_max_message_len() -> usize { 4000 }

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            radius_km: default_radius_km(),
            max_radius_km: default_max_radius_km(),
            ttl_secs: default_ttl_secs(),
            nearby_limit: default_nearby_limit(),
            grid_cell_deg: default_grid_cell_deg(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self { max_message_len: default_max_message_len() }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: None,
            db_pool_size: default_db_pool_size(),
            jwt_secret: default_jwt_secret(),
            jwt_ttl_secs: default_jwt_ttl(),
            password_min_len: default_password_min_len(),
            location: LocationConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PROXIMA").separator("__"))
            .build()?;
        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let loc = &self.location;
        if !(loc.radius_km > 0.0 && loc.radius_km <= loc.max_radius_km) {
            anyhow::bail!("location.radius_km must be in (0, max_radius_km]");
        }
        if !(loc.grid_cell_deg > 0.0 && loc.grid_cell_deg <= 10.0) {
            anyhow::bail!("location.grid_cell_deg must be in (0, 10]");
        }
        if loc.ttl_secs <= 0 {
            anyhow::bail!("location.ttl_secs must be positive");
        }
        if self.jwt_ttl_secs <= 0 {
            anyhow::bail!("jwt_ttl_secs must be positive");
        }
        Ok(())
    }
}
