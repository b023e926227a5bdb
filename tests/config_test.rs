use std::env;
use std::time::Duration;

use order_gateway::config::GatewayConfig;
use order_gateway::constants::{DEFAULT_APP_PREFIX, DEFAULT_BROKER_PREFIX, DEFAULT_PORT};

// Environment variables are process-wide, so everything runs in one test
#[test]
fn test_config_from_env() {
    let keys = [
        "ORDER_GATEWAY_PORT",
        "ORDER_GATEWAY_APP_PREFIX",
        "ORDER_GATEWAY_BROKER_PREFIX",
        "ORDER_GATEWAY_TIMEOUT",
        "ORDER_GATEWAY_PING",
        "ORDER_GATEWAY_HANDLER_TIMEOUT_MS",
    ];
    for key in keys {
        env::remove_var(key);
    }

    let config = GatewayConfig::from_env().unwrap();
    assert_eq!(config.port, DEFAULT_PORT);
    assert_eq!(config.app_prefix, DEFAULT_APP_PREFIX);
    assert_eq!(config.broker_prefix, DEFAULT_BROKER_PREFIX);

    env::set_var("ORDER_GATEWAY_PORT", "9090");
    env::set_var("ORDER_GATEWAY_APP_PREFIX", "application/");
    env::set_var("ORDER_GATEWAY_BROKER_PREFIX", "topic");
    env::set_var("ORDER_GATEWAY_HANDLER_TIMEOUT_MS", "250");
    let config = GatewayConfig::from_env().unwrap();
    assert_eq!(config.port, 9090);
    assert_eq!(config.app_prefix, "application");
    assert_eq!(config.broker_prefix, "topic");
    assert_eq!(config.handler_timeout, Duration::from_millis(250));

    env::set_var("ORDER_GATEWAY_PORT", "not-a-port");
    assert!(GatewayConfig::from_env().is_err());
    env::set_var("ORDER_GATEWAY_PORT", "9090");

    env::set_var("ORDER_GATEWAY_TIMEOUT", "5");
    env::set_var("ORDER_GATEWAY_PING", "10");
    assert!(GatewayConfig::from_env().is_err());

    for key in keys {
        env::remove_var(key);
    }
}
