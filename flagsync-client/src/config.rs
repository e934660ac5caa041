//! 同步引擎配置

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::SyncError;

/// 轮询调度配置
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Flag 定义轮询间隔
    pub features_refresh_rate: Duration,
    /// Segment / 成员关系轮询间隔
    pub segments_refresh_rate: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            features_refresh_rate: Duration::from_secs(60),
            segments_refresh_rate: Duration::from_secs(60),
        }
    }
}

/// 同步引擎配置
///
/// # 环境变量
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | FLAGSYNC_SDK_KEY | (空) | SDK key |
/// | FLAGSYNC_SDK_URL | https://sdk.split.io/api | 数据拉取地址 |
/// | FLAGSYNC_AUTH_URL | https://auth.split.io/api | 认证地址 |
/// | FLAGSYNC_STREAMING_URL | https://streaming.split.io | 推送地址 |
/// | FLAGSYNC_STREAMING_ENABLED | true | 是否启用推送 |
/// | FLAGSYNC_FEATURES_REFRESH_SECS | 60 | Flag 轮询间隔(秒) |
/// | FLAGSYNC_SEGMENTS_REFRESH_SECS | 60 | Segment 轮询间隔(秒) |
/// | FLAGSYNC_REQUEST_TIMEOUT_MS | 30000 | HTTP 请求超时(毫秒) |
/// | FLAGSYNC_READ_TIMEOUT_SECS | 70 | 推送流读超时(秒) |
/// | FLAGSYNC_BACKOFF_BASE_MS | 1000 | 重连退避初始值(毫秒) |
/// | FLAGSYNC_BACKOFF_MAX_MS | 60000 | 重连退避上限(毫秒) |
///
/// # 示例
///
/// ```ignore
/// FLAGSYNC_SDK_KEY=xxx FLAGSYNC_STREAMING_ENABLED=false cargo run --example watch
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// SDK key, 作为 Bearer token 发送
    pub sdk_key: String,
    /// 数据拉取服务地址 (splitChanges / segmentChanges / mySegments)
    pub sdk_url: String,
    /// 认证服务地址
    pub auth_url: String,
    /// 推送服务地址
    pub streaming_url: String,
    /// 是否启用推送 (false 时只轮询)
    pub streaming_enabled: bool,
    /// 轮询调度
    pub scheduler: SchedulerConfig,
    /// HTTP 请求超时
    pub request_timeout: Duration,
    /// 推送流读超时 (包括心跳)
    pub read_timeout: Duration,
    /// 推送重连退避曲线
    pub backoff: BackoffConfig,
    /// 连续失败多少次后启动轮询兜底
    pub fallback_after_failures: u32,
    /// 连接保持多久算稳定 (稳定后重置退避)
    pub stability_window: Duration,
    /// Token 过期前多久刷新
    pub token_refresh_margin: Duration,
    /// Token 刷新最短间隔
    pub min_token_refresh: Duration,
    /// 推送触发的 flag 拉取未达到目标版本时的重试次数
    pub targeted_fetch_retries: u32,
    /// 上述重试的退避曲线
    pub targeted_fetch_backoff: BackoffConfig,
    /// 更新事件广播容量
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sdk_key: String::new(),
            sdk_url: "https://sdk.split.io/api".into(),
            auth_url: "https://auth.split.io/api".into(),
            streaming_url: "https://streaming.split.io".into(),
            streaming_enabled: true,
            scheduler: SchedulerConfig::default(),
            request_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(70),
            backoff: BackoffConfig::default(),
            fallback_after_failures: 1,
            stability_window: Duration::from_secs(30),
            token_refresh_margin: Duration::from_secs(600),
            min_token_refresh: Duration::from_secs(60),
            targeted_fetch_retries: 3,
            targeted_fetch_backoff: BackoffConfig::default()
                .with_base(Duration::from_millis(500))
                .with_max(Duration::from_secs(5))
                .with_jitter(0.0),
            event_capacity: 64,
        }
    }
}

impl SyncConfig {
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Self {
            sdk_key: sdk_key.into(),
            ..Self::default()
        }
    }

    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置，使用默认值
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sdk_key: std::env::var("FLAGSYNC_SDK_KEY").unwrap_or_default(),
            sdk_url: std::env::var("FLAGSYNC_SDK_URL").unwrap_or(defaults.sdk_url),
            auth_url: std::env::var("FLAGSYNC_AUTH_URL").unwrap_or(defaults.auth_url),
            streaming_url: std::env::var("FLAGSYNC_STREAMING_URL")
                .unwrap_or(defaults.streaming_url),
            streaming_enabled: std::env::var("FLAGSYNC_STREAMING_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            scheduler: SchedulerConfig {
                features_refresh_rate: env_secs("FLAGSYNC_FEATURES_REFRESH_SECS")
                    .unwrap_or(defaults.scheduler.features_refresh_rate),
                segments_refresh_rate: env_secs("FLAGSYNC_SEGMENTS_REFRESH_SECS")
                    .unwrap_or(defaults.scheduler.segments_refresh_rate),
            },
            request_timeout: env_millis("FLAGSYNC_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            read_timeout: env_secs("FLAGSYNC_READ_TIMEOUT_SECS").unwrap_or(defaults.read_timeout),
            backoff: BackoffConfig {
                base: env_millis("FLAGSYNC_BACKOFF_BASE_MS").unwrap_or(defaults.backoff.base),
                max: env_millis("FLAGSYNC_BACKOFF_MAX_MS").unwrap_or(defaults.backoff.max),
                ..defaults.backoff
            },
            ..defaults
        }
    }

    pub fn with_urls(
        mut self,
        sdk_url: impl Into<String>,
        auth_url: impl Into<String>,
        streaming_url: impl Into<String>,
    ) -> Self {
        self.sdk_url = sdk_url.into();
        self.auth_url = auth_url.into();
        self.streaming_url = streaming_url.into();
        self
    }

    /// 所有服务指向同一地址 (mock 控制面)
    pub fn with_base_url(self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.with_urls(base_url.clone(), base_url.clone(), base_url)
    }

    pub fn with_streaming_enabled(mut self, enabled: bool) -> Self {
        self.streaming_enabled = enabled;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_fallback_after_failures(mut self, failures: u32) -> Self {
        self.fallback_after_failures = failures;
        self
    }

    pub fn with_stability_window(mut self, window: Duration) -> Self {
        self.stability_window = window;
        self
    }

    pub fn with_targeted_fetch_retries(mut self, retries: u32, backoff: BackoffConfig) -> Self {
        self.targeted_fetch_retries = retries;
        self.targeted_fetch_backoff = backoff;
        self
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sdk_key.trim().is_empty() {
            return Err(SyncError::Config("sdk_key must not be empty".into()));
        }
        if self.scheduler.features_refresh_rate.is_zero()
            || self.scheduler.segments_refresh_rate.is_zero()
        {
            return Err(SyncError::Config("refresh rates must be positive".into()));
        }
        for backoff in [&self.backoff, &self.targeted_fetch_backoff] {
            if backoff.multiplier < 1.0 {
                return Err(SyncError::Config("backoff multiplier must be >= 1.0".into()));
            }
            if !(0.0..=1.0).contains(&backoff.jitter) {
                return Err(SyncError::Config("backoff jitter must be within 0..=1".into()));
            }
        }
        if self.fallback_after_failures == 0 {
            return Err(SyncError::Config(
                "fallback_after_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}
