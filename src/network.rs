use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::core::{ConnectivityProbe, Result};

/// 连通状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// 网络监视器，只广播状态切换
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<Connectivity>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

impl NetworkMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// 上报当前状态，返回是否发生了切换
    pub fn report(&self, state: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(?state, "connectivity changed");
        }
        changed
    }

    pub fn set_online(&self) -> bool {
        self.report(Connectivity::Online)
    }

    pub fn set_offline(&self) -> bool {
        self.report(Connectivity::Offline)
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// 周期性探测并上报结果
    pub fn spawn_probe<P>(
        self: &Arc<Self>,
        probe: P,
        period: Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()>
    where
        P: ConnectivityProbe + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = probe.is_online().await;
                        debug!(online, "connectivity probe");
                        monitor.report(if online { Connectivity::Online } else { Connectivity::Offline });
                    }
                }
            }
        })
    }
}

/// HEAD 请求探测；只要收到任何 HTTP 响应就视为在线
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// 未配置 `probe_url` 时返回 None
    pub fn from_config(config: &ApiConfig) -> Result<Option<Self>> {
        let Some(url) = &config.probe_url else {
            return Ok(None);
        };
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout())
            .build()?;
        Ok(Some(Self::new(client, url.clone())))
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        self.client.head(&self.url).send().await.is_ok()
    }
}
