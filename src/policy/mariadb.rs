//! MariaDB-backed policy repository over `sqlx`.
//!
//! Catalog tables: `SID_API_DTL_MNG` (per-API entries), `SID_API_GRP_MNG`
//! (groups), `SID_BIZ_SRVC_API_RLP` (caller bindings), `SID_API_EST_MNG`
//! (feature flags). Rows are live only while `USG_YN = 'Y'`.

use crate::core::config::DbConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::policy::{check_control_codes, now_hhmmss, PolicyError, PolicyRepository, RequestData};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

pub struct MariaDbRepository {
    pool: MySqlPool,
    group_code: String,
}

impl MariaDbRepository {
    /// Open the connection pool and verify connectivity.
    pub async fn connect(cfg: &DbConfig, group_code: &str) -> GatewayResult<Self> {
        let dsn = format!(
            "mysql://{}:{}@{}:{}/{}",
            cfg.user, cfg.password, cfg.host, cfg.port, cfg.name
        );
        let pool = MySqlPoolOptions::new()
            .max_connections(20)
            .min_connections(5)
            .max_lifetime(Duration::from_secs(30 * 60))
            .connect(&dsn)
            .await
            .map_err(|e| GatewayError::config(format!("failed to connect to policy db: {e}")))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| GatewayError::config(format!("policy db ping failed: {e}")))?;

        info!(host = %cfg.host, db = %cfg.name, "policy repository connected");
        Ok(Self {
            pool,
            group_code: group_code.to_string(),
        })
    }
}

const FIND_REQUEST_DATA: &str = "SELECT API_CD, API_GROUP_CD, TARGET_URI \
     FROM SID_API_DTL_MNG \
     WHERE API_PATH = ? AND USG_YN = 'Y' AND API_TYP_CD = '00' LIMIT 1";

const FIND_API_CONTROL: &str = "SELECT API_CLOT_CTL_CD, API_CLOT_UABL_STA_TIM, API_CLOT_UABL_END_TIM \
     FROM SID_API_DTL_MNG \
     WHERE API_PATH = ? AND USG_YN = 'Y' AND API_TYP_CD = '00' LIMIT 1";

const FIND_GROUP_CONTROL: &str = "SELECT API_GROUP_CLOT_CTL_CD, API_GROUP_CLOT_UABL_STA_TIM, API_GROUP_CLOT_UABL_END_TIM \
     FROM SID_API_GRP_MNG \
     WHERE API_GROUP_CD = ? AND USG_YN = 'Y'";

const EXIST_USE_API: &str = "SELECT EXISTS ( SELECT 1 FROM SID_BIZ_SRVC_API_RLP \
     WHERE API_GROUP_CD = ? AND API_CD = ? AND BIZ_SRVC_CD = ? AND USG_YN = 'Y' )";

const EXIST_CONFIG: &str = "SELECT EXISTS ( SELECT 1 FROM SID_API_EST_MNG \
     WHERE API_GROUP_CD = ? AND VALUE = ? AND USG_YN = 'Y' )";

type ControlRow = (Option<String>, Option<String>, Option<String>);

fn run_control_check(row: ControlRow) -> Result<bool, PolicyError> {
    let code = row.0.unwrap_or_default();
    let start = row.1.unwrap_or_default();
    let end = row.2.unwrap_or_default();
    check_control_codes(&code, &start, &end, &now_hhmmss()).map(|()| true)
}

#[async_trait]
impl PolicyRepository for MariaDbRepository {
    async fn find_request_data(&self, mut input: RequestData) -> Result<RequestData, PolicyError> {
        let row = sqlx::query_as::<_, (String, String, Option<String>)>(FIND_REQUEST_DATA)
            .bind(&input.request_url)
            .fetch_optional(&self.pool)
            .await?;

        if let Some((api_code, group_code, target)) = row {
            input.api_code = api_code;
            input.api_group_code = group_code;
            input.request_host = target.unwrap_or_default();
        }
        Ok(input)
    }

    async fn exist_use_api_list(&self, input: &RequestData) -> Result<bool, PolicyError> {
        let exists: i64 = sqlx::query_scalar(EXIST_USE_API)
            .bind(&input.api_group_code)
            .bind(&input.api_code)
            .bind(&input.biz_service_code)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists == 1)
    }

    async fn exist_api_group(&self, input: &RequestData) -> Result<bool, PolicyError> {
        let row = sqlx::query_as::<_, ControlRow>(FIND_GROUP_CONTROL)
            .bind(&input.api_group_code)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            // Control refusal propagates so the code-specific message surfaces.
            Some(row) => run_control_check(row),
            None => Ok(false),
        }
    }

    async fn exist_api(&self, input: &RequestData) -> Result<bool, PolicyError> {
        let row = sqlx::query_as::<_, ControlRow>(FIND_API_CONTROL)
            .bind(&input.request_url)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            // A per-API control refusal denies the API (404 upstream).
            Some(row) => match run_control_check(row) {
                Ok(open) => Ok(open),
                Err(PolicyError::Control(msg)) => {
                    warn!(api = %input.request_url, %msg, "api refused by control code");
                    Ok(false)
                }
                Err(e) => Err(e),
            },
            None => Ok(false),
        }
    }

    async fn exist_config(&self, key: &str) -> Result<bool, PolicyError> {
        let exists: i64 = sqlx::query_scalar(EXIST_CONFIG)
            .bind(&self.group_code)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists == 1)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
