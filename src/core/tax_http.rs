use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::warn;

use super::error::TaxError;
use super::tax::{TaxBatchRequest, TaxBatchResponse, TaxService};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Posts each yearly batch as JSON to an external tax service.
#[derive(Debug, Clone)]
pub struct HttpTaxService {
    client: Client,
    endpoint: String,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpTaxService {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TaxError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| TaxError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(250),
        })
    }

    pub fn with_retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn attempt(&self, request: &TaxBatchRequest) -> Result<TaxBatchResponse, Attempt> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .map_err(|err| Attempt::Retry(TaxError::Transport(err.to_string())))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            let err = TaxError::Status {
                status: status.as_u16(),
                body,
            };
            return Err(if status.is_server_error() {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            });
        }

        resp.json::<TaxBatchResponse>()
            .map_err(|err| Attempt::Fatal(TaxError::Malformed(err.to_string())))
    }
}

enum Attempt {
    Retry(TaxError),
    Fatal(TaxError),
}

impl TaxService for HttpTaxService {
    fn calculate_batch(&self, request: &TaxBatchRequest) -> Result<TaxBatchResponse, TaxError> {
        let mut attempt = 1;
        loop {
            match self.attempt(request) {
                Ok(response) => return Ok(response),
                Err(Attempt::Fatal(err)) => return Err(err),
                Err(Attempt::Retry(err)) if attempt >= self.max_attempts => return Err(err),
                Err(Attempt::Retry(err)) => {
                    warn!(
                        endpoint = %self.endpoint,
                        tax_year = request.tax_year,
                        attempt,
                        error = %err,
                        "tax service call failed, retrying"
                    );
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tax::TaxFacts;
    use crate::core::types::FilingStatus;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    /// Serves one canned `(status, body)` per incoming connection, then exits.
    fn serve(responses: Vec<(u16, &'static str)>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/tax", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut bodies = Vec::new();
            for (status, body) in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if let Some(value) = lower.strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut request_body = vec![0; content_length];
                reader.read_exact(&mut request_body).unwrap();
                bodies.push(String::from_utf8(request_body).unwrap());

                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
            }
            bodies
        });
        (url, handle)
    }

    fn request() -> TaxBatchRequest {
        TaxBatchRequest {
            tax_year: 2027,
            filing_status: FilingStatus::Joint,
            jurisdiction: "NY".to_string(),
            households: vec![
                TaxFacts {
                    capital_gains: 1_000.0,
                    age: 67,
                    ..TaxFacts::default()
                },
                TaxFacts::default(),
            ],
        }
    }

    #[test]
    fn posts_camel_case_batch_and_decodes_totals() {
        let (url, server) = serve(vec![(200, r#"{"totalTax":[150.0,0.0]}"#)]);
        let service = HttpTaxService::new(url).unwrap();
        let response = service.calculate_batch(&request()).unwrap();
        assert_eq!(response.total_tax, vec![150.0, 0.0]);

        let bodies = server.join().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(sent["taxYear"], 2027);
        assert_eq!(sent["filingStatus"], "JOINT");
        assert_eq!(sent["households"][0]["capitalGains"], 1_000.0);
    }

    #[test]
    fn retries_server_errors_then_succeeds() {
        let (url, server) = serve(vec![(503, "busy"), (200, r#"{"totalTax":[1.0,2.0]}"#)]);
        let service = HttpTaxService::new(url)
            .unwrap()
            .with_retries(3, Duration::from_millis(1));
        let response = service.calculate_batch(&request()).unwrap();
        assert_eq!(response.total_tax, vec![1.0, 2.0]);
        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[test]
    fn client_errors_and_bad_bodies_are_fatal() {
        let (url, server) = serve(vec![(400, "bad filing status")]);
        let service = HttpTaxService::new(url)
            .unwrap()
            .with_retries(3, Duration::from_millis(1));
        let err = service.calculate_batch(&request()).unwrap_err();
        assert!(matches!(err, TaxError::Status { status: 400, .. }));
        assert_eq!(server.join().unwrap().len(), 1);

        let (url, server) = serve(vec![(200, r#"{"tax":[]}"#)]);
        let service = HttpTaxService::new(url).unwrap();
        let err = service.calculate_batch(&request()).unwrap_err();
        assert!(matches!(err, TaxError::Malformed(_)));
        server.join().unwrap();
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (url, server) = serve(vec![(500, "down"), (500, "down")]);
        let service = HttpTaxService::new(url)
            .unwrap()
            .with_retries(2, Duration::from_millis(1));
        let err = service.calculate_batch(&request()).unwrap_err();
        assert!(matches!(err, TaxError::Status { status: 500, .. }));
        server.join().unwrap();
    }
}
