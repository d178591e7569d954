use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use privatecaptcha_shield::{
    ip_buckets::extract_client_key,
    level_controller::{Baseline, GrowthClass, LevelController, LevelControllerConfig, PropertyConfig},
    time_series::InMemoryTimeSeries,
    Config, IpBuckets, RateLimiter,
};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::info;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config: Config = match fs::read_to_string("./Config.toml") {
        Ok(raw) => toml::from_str(&raw).expect("failed to parse Config.toml"),
        Err(_) => {
            info!("./Config.toml not found, starting from defaults");
            Config::default()
        }
    };

    let puzzle_buckets = Arc::new(
        IpBuckets::new(
            "puzzle",
            config.rate_limit_header.clone(),
            config.max_buckets,
            config.puzzle_bucket_capacity,
            config.puzzle_bucket_interval,
        )
        .expect("valid puzzle bucket configuration"),
    );
    let portal_buckets = Arc::new(
        IpBuckets::new(
            "portal",
            config.rate_limit_header.clone(),
            config.max_buckets,
            config.default_bucket_capacity,
            config.default_bucket_interval,
        )
        .expect("valid portal bucket configuration"),
    );
    // Endpoints reserved for authenticated sessions sit behind their own,
    // looser pool. A session also "legitimizes" its own IP on the portal
    // pool (see the `/auth/login` handler below), so the same client keeps
    // its elevated limits on general navigation after logging in, not just
    // on this pool.
    let authenticated_buckets = Arc::new(
        IpBuckets::new(
            "authenticated",
            config.rate_limit_header.clone(),
            config.max_buckets,
            config.authenticated_bucket_capacity,
            config.authenticated_bucket_interval,
        )
        .expect("valid authenticated bucket configuration"),
    );

    let puzzle_limiter = Arc::new(RateLimiter::new(puzzle_buckets, 1, "puzzle"));
    let portal_limiter = Arc::new(RateLimiter::new(portal_buckets.clone(), 1, "portal"));
    let authenticated_limiter = Arc::new(RateLimiter::new(authenticated_buckets, 1, "authenticated"));

    // A real deployment swaps this for a backend wired to the time
    // series store; the demo binary runs against an empty in-memory
    // one so the controller has a collaborator to poll.
    let mut properties = HashMap::new();
    properties.insert(
        1,
        PropertyConfig {
            growth_class: GrowthClass::Slow,
            baseline: Baseline::Small,
        },
    );
    let mut level_controller = LevelController::new(
        Arc::new(InMemoryTimeSeries::new()),
        LevelControllerConfig {
            tick_interval: config.level_controller_interval,
            jitter: config.level_controller_jitter,
            bucket_size: config.property_bucket_size,
            lookback: config.property_bucket_size,
            batch_size: config.levels_batch_size,
            query_timeout: Duration::from_secs(8),
        },
        properties,
    );
    level_controller.start();

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    let make_svc = make_service_fn(move |_conn| {
        let puzzle_limiter = puzzle_limiter.clone();
        let portal_limiter = portal_limiter.clone();
        let portal_buckets = portal_buckets.clone();
        let authenticated_limiter = authenticated_limiter.clone();
        let authenticated_capacity = config.authenticated_bucket_capacity;
        let authenticated_interval = config.authenticated_bucket_interval;
        let rate_limit_header = config.rate_limit_header.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let puzzle_limiter = puzzle_limiter.clone();
                let portal_limiter = portal_limiter.clone();
                let portal_buckets = portal_buckets.clone();
                let authenticated_limiter = authenticated_limiter.clone();
                let rate_limit_header = rate_limit_header.clone();
                async move {
                    let now = now_ms();
                    let path = req.uri().path();

                    // A session "legitimizing" itself: raise the caller's
                    // portal-pool bucket to the configured authenticated
                    // parameters, preserving its current level.
                    if path == "/auth/login" {
                        let header_value = if rate_limit_header.is_empty() {
                            None
                        } else {
                            req.headers()
                                .get(&rate_limit_header)
                                .and_then(|v| v.to_str().ok())
                        };
                        let key = extract_client_key(&rate_limit_header, header_value, None);
                        match portal_buckets.update_limits_for_key(
                            key,
                            authenticated_capacity,
                            authenticated_interval,
                            now,
                        ) {
                            Ok(()) => {
                                return Ok::<_, Infallible>(
                                    Response::new(Body::from("legitimized")),
                                );
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to legitimize client");
                                let mut response = Response::new(Body::from("error"));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                return Ok::<_, Infallible>(response);
                            }
                        }
                    }

                    let limiter = if path.starts_with("/puzzle") {
                        &puzzle_limiter
                    } else if path.starts_with("/account") {
                        &authenticated_limiter
                    } else {
                        &portal_limiter
                    };
                    let response = limiter
                        .handle(req, None, now, |_req| async move {
                            Response::new(Body::from("ok"))
                        })
                        .await;
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Starting privatecaptcha-shield on {addr}");
    let server = Server::bind(&addr).serve(make_svc);
    if let Err(err) = server.await {
        tracing::error!(error = %err, "server error");
    }

    level_controller.stop(Duration::from_secs(5)).await;
}
