//! `test-utils` is used for testing in both `prc-lib` and `prc-bin`.
//! This crate does not depend on `prc-lib` or `prc-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock API server, which responds with a predefined status when
/// handling any GET request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Create a mock API server answering every request with an error body
/// as sent by the PRC API, e.g. `{"code": 2002, "message": "..."}`
#[macro_export]
macro_rules! mock_api_error {
    ($status:expr, $code:expr, $message:expr $(,)?) => {{
        let mock_server = wiremock::MockServer::start().await;
        let template = wiremock::ResponseTemplate::new(http::StatusCode::from($status))
            .set_body_json(serde_json::json!({ "code": $code, "message": $message }));
        wiremock::Mock::given(wiremock::matchers::any())
            .respond_with(template)
            .mount(&mock_server)
            .await;
        mock_server
    }};
}

/// A server key in the format accepted by the PRC API, which is not
/// known to any server
#[macro_export]
macro_rules! fake_server_key {
    () => {
        concat!("abcdefghij-", "klmnopqrstuvwxyzabcdefghijklmnopqrstuvwxyzab")
    };
}
