use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use coupon_core::{ids::IdMint, types::CampaignId};

/// Runtime configuration for the `coupon-server` binary.
///
/// Every setting can be given as a CLI flag or an environment variable. The
/// defaults suit a single instance serving a handful of hot campaigns.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "coupon-server",
    version,
    about = "An HTTP service for first-come, stock-bounded coupon issuance"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8080"))]
    pub server_addr: String,

    /// Number of dispatcher workers. Each worker drains exactly one queue
    /// partition, so this is also the partition count.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Maximum number of queued requests per campaign. Admission answers
    /// `429` beyond this.
    ///
    /// Environment variable: `MAX_QUEUE_DEPTH`
    #[arg(long, env = "MAX_QUEUE_DEPTH", default_value_t = 10_000)]
    pub max_queue_depth: usize,

    /// Capacity of each partition channel, shared by every campaign hashed
    /// onto it.
    ///
    /// Environment variable: `PARTITION_BUFFER`
    #[arg(long, env = "PARTITION_BUFFER", default_value_t = 65_536)]
    pub partition_buffer: usize,

    /// How long an idle worker waits on its partition before looping.
    ///
    /// Environment variable: `DEQUEUE_TIMEOUT_MS`
    #[arg(long, env = "DEQUEUE_TIMEOUT_MS", default_value_t = 1_000)]
    pub dequeue_timeout_ms: u64,

    /// Minimum retention of terminal status records.
    ///
    /// Environment variable: `STATUS_TTL_SECS`
    #[arg(long, env = "STATUS_TTL_SECS", default_value_t = 3_600)]
    pub status_ttl_secs: u64,

    /// Period of the background sweep that purges expired status records.
    ///
    /// Environment variable: `SWEEP_INTERVAL_SECS`
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Upper bound on draining queued work during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Cap on the `waitMs` long-poll of the status endpoint.
    ///
    /// Environment variable: `MAX_STATUS_WAIT_MS`
    #[arg(long, env = "MAX_STATUS_WAIT_MS", default_value_t = 5_000)]
    pub max_status_wait_ms: u64,

    /// Hint returned in `Retry-After` on overload.
    ///
    /// Environment variable: `RETRY_AFTER_SECS`
    #[arg(long, env = "RETRY_AFTER_SECS", default_value_t = 1)]
    pub retry_after_secs: u64,

    /// Allow stock resets while requests for the campaign are in flight.
    /// Meant for test environments only.
    ///
    /// Environment variable: `ALLOW_LIVE_RESET`
    #[arg(long, env = "ALLOW_LIVE_RESET", default_value_t = false)]
    pub allow_live_reset: bool,

    /// Snowflake machine id of this instance. Must be unique among instances
    /// sharing an id namespace.
    ///
    /// Environment variable: `MACHINE_ID`
    #[arg(long, env = "MACHINE_ID", default_value_t = 0)]
    pub machine_id: u64,

    /// Number of lock shards for the status store and ticket index.
    ///
    /// Environment variable: `STORE_SHARDS`
    #[arg(long, env = "STORE_SHARDS", default_value_t = 64)]
    pub store_shards: usize,

    /// Campaigns registered at startup, as `id=total` pairs separated by
    /// commas.
    ///
    /// Example: "1=100,2=5000"
    ///
    /// Environment variable: `SEED_CAMPAIGNS`
    #[arg(long, env = "SEED_CAMPAIGNS", default_value_t = String::new())]
    pub seed_campaigns: String,

    /// Fixed discount, in minor currency units, given to seeded campaigns and
    /// to registered campaigns without a discount policy.
    ///
    /// Environment variable: `DEFAULT_DISCOUNT`
    #[arg(long, env = "DEFAULT_DISCOUNT", default_value_t = 1_000)]
    pub default_discount: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub max_queue_depth: usize,
    pub partition_buffer: usize,
    pub dequeue_timeout: Duration,
    pub status_ttl: Duration,
    pub sweep_interval: Duration,
    pub shutdown_timeout: Duration,
    pub max_status_wait: Duration,
    pub retry_after_secs: u64,
    pub allow_live_reset: bool,
    pub machine_id: u64,
    pub store_shards: usize,
    pub seed_campaigns: Vec<(CampaignId, u64)>,
    pub default_discount: u64,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.max_queue_depth == 0 {
            bail!("MAX_QUEUE_DEPTH must be greater than 0");
        }
        if args.partition_buffer == 0 {
            bail!("PARTITION_BUFFER must be greater than 0");
        }
        if args.dequeue_timeout_ms == 0 {
            bail!("DEQUEUE_TIMEOUT_MS must be greater than 0");
        }
        if args.sweep_interval_secs == 0 {
            bail!("SWEEP_INTERVAL_SECS must be greater than 0");
        }
        if args.store_shards == 0 {
            bail!("STORE_SHARDS must be greater than 0");
        }

        let max_machine_id = IdMint::max_machine_id();
        if args.machine_id > max_machine_id {
            bail!(
                "MACHINE_ID ({}) exceeds available Snowflake machine ID space (max = {})",
                args.machine_id,
                max_machine_id
            );
        }

        let seed_campaigns = parse_seeds(&args.seed_campaigns)?;

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            max_queue_depth: args.max_queue_depth,
            partition_buffer: args.partition_buffer,
            dequeue_timeout: Duration::from_millis(args.dequeue_timeout_ms),
            status_ttl: Duration::from_secs(args.status_ttl_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            max_status_wait: Duration::from_millis(args.max_status_wait_ms),
            retry_after_secs: args.retry_after_secs,
            allow_live_reset: args.allow_live_reset,
            machine_id: args.machine_id,
            store_shards: args.store_shards,
            seed_campaigns,
            default_discount: args.default_discount,
        })
    }
}

fn parse_seeds(raw: &str) -> anyhow::Result<Vec<(CampaignId, u64)>> {
    let mut seeds = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((id, total)) = pair.split_once('=') else {
            bail!("SEED_CAMPAIGNS entry `{pair}` is not of the form id=total");
        };
        let id: u64 = id
            .trim()
            .parse()
            .with_context(|| format!("invalid campaign id in `{pair}`"))?;
        let total: u64 = total
            .trim()
            .parse()
            .with_context(|| format!("invalid total in `{pair}`"))?;
        if seeds.iter().any(|(seen, _)| *seen == CampaignId(id)) {
            bail!("SEED_CAMPAIGNS lists campaign {id} twice");
        }
        seeds.push((CampaignId(id), total));
    }
    Ok(seeds)
}

#[cfg(test)]
impl ServerConfig {
    /// Small, fast settings for in-process tests.
    pub fn for_tests() -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            num_workers: 2,
            max_queue_depth: 1_000,
            partition_buffer: 1_024,
            dequeue_timeout: Duration::from_millis(20),
            status_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(2),
            max_status_wait: Duration::from_millis(2_000),
            retry_after_secs: 1,
            allow_live_reset: false,
            machine_id: 1,
            store_shards: 8,
            seed_campaigns: Vec::new(),
            default_discount: 1_000,
        }
    }
}
