#[cfg(test)]
mod cli {
    use std::fs;

    use assert_cmd::cargo::cargo_bin_cmd;
    use http::StatusCode;
    use predicates::str::contains;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tempfile::tempdir;
    use test_utils::{fake_server_key, mock_api_error, mock_server};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A `prc` command which does not pick up keys from the environment
    fn prc() -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!();
        cmd.env_remove("PRC_SERVER_KEY")
            .env_remove("PRC_GLOBAL_KEY")
            .env_remove("RUST_LOG");
        cmd
    }

    #[tokio::test]
    async fn test_get_prints_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server/players"))
            .and(header("server-key", fake_server_key!()))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[{"Player":"Someone:1"}]"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        prc()
            .arg("--base-url")
            .arg(mock_server.uri())
            .arg("--server-key")
            .arg(fake_server_key!())
            .arg("get")
            .arg("server/players")
            .assert()
            .success()
            .stdout(contains("Someone:1"));
    }

    #[tokio::test]
    async fn test_get_with_params() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server/killlogs"))
            .and(query_param("limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&mock_server)
            .await;

        prc()
            .env("PRC_SERVER_KEY", fake_server_key!())
            .args(["--base-url", mock_server.uri().as_str()])
            .args(["get", "/server/killlogs", "--param", "limit=10"])
            .assert()
            .success()
            .stdout("[]\n");
    }

    #[tokio::test]
    async fn test_command_posts_json() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/server/command"))
            .and(header("authorization", "global-key"))
            .and(body_json(serde_json::json!({"command": ":h Hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"message":"Success"}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        prc()
            .env("PRC_SERVER_KEY", fake_server_key!())
            .env("PRC_GLOBAL_KEY", "global-key")
            .args(["--base-url", mock_server.uri().as_str()])
            .args(["command", ":h Hello"])
            .assert()
            .success()
            .stdout(contains("Success"));
    }

    #[tokio::test]
    async fn test_api_error_fails() {
        let mock_server = mock_api_error!(StatusCode::FORBIDDEN, 2004, "Banned");

        prc()
            .env("PRC_SERVER_KEY", fake_server_key!())
            .args(["--base-url", mock_server.uri().as_str()])
            .args(["get", "/server"])
            .assert()
            .failure()
            .code(1)
            .stderr(contains("server key is banned (code 2004)"));
    }

    #[tokio::test]
    async fn test_stats() {
        let mock_server = mock_server!(StatusCode::OK, set_body_string("{}"));

        let output = prc()
            .env("PRC_SERVER_KEY", fake_server_key!())
            .args(["--base-url", mock_server.uri().as_str(), "--stats"])
            .args(["get", "/server"])
            .output()
            .unwrap();

        assert!(output.status.success());
        let stats: Value = serde_json::from_slice(&output.stderr).unwrap();
        assert_eq!(stats["upstream_requests"], 1);
        assert_eq!(stats["successes"], 1);
    }

    #[tokio::test]
    async fn test_config_file() {
        let mock_server = mock_server!(StatusCode::OK, set_body_string("from config"));
        let dir = tempdir().unwrap();
        let config = dir.path().join("custom.toml");
        fs::write(
            &config,
            format!(
                "server_key = \"{}\"\nbase_url = \"{}\"\nmax_retries = 1\n",
                fake_server_key!(),
                mock_server.uri()
            ),
        )
        .unwrap();

        prc()
            .arg("--config")
            .arg(&config)
            .args(["get", "/server"])
            .assert()
            .success()
            .stdout(contains("from config"));
    }

    #[tokio::test]
    async fn test_default_config_file_in_working_directory() {
        let mock_server = mock_server!(StatusCode::OK, set_body_string("from prc.toml"));
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("prc.toml"),
            format!(
                "server_key = \"{}\"\nbase_url = \"{}\"\n",
                fake_server_key!(),
                mock_server.uri()
            ),
        )
        .unwrap();

        prc()
            .current_dir(dir.path())
            .args(["get", "/server"])
            .assert()
            .success()
            .stdout(contains("from prc.toml"));
    }

    #[test]
    fn test_invalid_config_file() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("broken.toml");
        fs::write(&config, "retries = 3").unwrap();

        prc()
            .arg("--config")
            .arg(&config)
            .args(["get", "/server"])
            .assert()
            .failure()
            .stderr(contains("Cannot load configuration file"));
    }

    #[test]
    fn test_missing_server_key() {
        prc()
            .args(["get", "/server"])
            .assert()
            .failure()
            .code(1)
            .stderr(contains("No server key given"));
    }

    #[test]
    fn test_malformed_server_key() {
        prc()
            .args(["--server-key", "not-a-key", "get", "/server"])
            .assert()
            .failure()
            .stderr(contains("Invalid server-key format"));
    }

    #[test]
    fn test_help() {
        prc()
            .arg("--help")
            .assert()
            .success()
            .stdout(contains("get"))
            .stdout(contains("command"));
    }
}
