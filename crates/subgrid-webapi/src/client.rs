use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use std::time::Duration;
use tracing::{debug, error, info};

use subgrid::{EntityService, RetrievedPage};
use subgrid_api::{EntityDefinition, ServiceFailure};

use crate::config::WebApiConfig;
use crate::error::{Result, WebApiError};
use crate::models::{error_message, parse_collection_page, parse_entity_definition};

const FORMATTED_VALUES_PREFERENCE: &str =
    "odata.include-annotations=\"OData.Community.Display.V1.FormattedValue\"";

const BODY_PREVIEW_CHARS: usize = 500;

/// `EntityService` over the OData v4 Web API.
pub struct WebApiClient {
    api_root: String,
    default_headers: HeaderMap,
    client: reqwest::Client,
}

impl WebApiClient {
    pub fn new(config: &WebApiConfig) -> Result<Self> {
        let api_root = config.api_root()?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("OData-MaxVersion", HeaderValue::from_static("4.0"));
        headers.insert("OData-Version", HeaderValue::from_static("4.0"));

        let prefer = match config.max_page_size {
            Some(size) => format!("{FORMATTED_VALUES_PREFERENCE},odata.maxpagesize={size}"),
            None => FORMATTED_VALUES_PREFERENCE.to_string(),
        };
        headers.insert(
            "Prefer",
            prefer
                .parse()
                .map_err(|_| WebApiError::InvalidHeader("Prefer".to_string()))?,
        );

        if let Some(token) = &config.access_token {
            headers.insert(
                AUTHORIZATION,
                format!("Bearer {}", token)
                    .parse()
                    .map_err(|_| WebApiError::InvalidHeader("Authorization".to_string()))?,
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api_root,
            default_headers: headers,
            client,
        })
    }

    pub fn api_root(&self) -> &str {
        &self.api_root
    }

    /// A next link is already absolute; anything else is a collection under the API root.
    pub fn collection_url(&self, collection: &str, query: &str) -> String {
        if collection.starts_with("https://") || collection.starts_with("http://") {
            return format!("{}{}", collection, query);
        }
        format!("{}/{}{}", self.api_root, collection, query)
    }

    pub fn definition_url(&self, logical_name: &str) -> String {
        format!(
            "{}/EntityDefinitions(LogicalName='{}')?$select=LogicalName,EntitySetName,PrimaryIdAttribute,PrimaryNameAttribute,DisplayName&$expand=Attributes($select=LogicalName,AttributeType,DisplayName)",
            self.api_root, logical_name
        )
    }

    pub fn lookups_url(&self, logical_name: &str) -> String {
        format!(
            "{}/EntityDefinitions(LogicalName='{}')/Attributes/Microsoft.Dynamics.CRM.LookupAttributeMetadata?$select=LogicalName,Targets",
            self.api_root, logical_name
        )
    }

    fn format_reqwest_error(e: &reqwest::Error, url: &str, operation: &str) -> String {
        if e.is_timeout() {
            format!(
                "Failed to {} for {}: timeout - request took too long (check network or increase timeout_secs)",
                operation, url
            )
        } else if e.is_connect() {
            format!(
                "Failed to {} for {}: connection error - check network connectivity, DNS resolution, and firewall settings. Error: {}",
                operation, url, e
            )
        } else if e.is_request() {
            format!(
                "Failed to {} for {}: request error - invalid URL format or malformed request parameters. Error: {}",
                operation, url, e
            )
        } else if e.is_decode() {
            format!(
                "Failed to {} for {}: decode error - unexpected response format from server. Error: {}",
                operation, url, e
            )
        } else {
            let display_str = e.to_string();
            let debug_str = format!("{:?}", e);
            if display_str.contains("certificate")
                || display_str.contains("TLS")
                || debug_str.contains("certificate")
            {
                format!(
                    "Failed to {} for {}: TLS/certificate error - check SSL certificate configuration. Error: {}",
                    operation, url, e
                )
            } else if e.is_redirect() {
                format!(
                    "Failed to {} for {}: redirect error - too many redirects or invalid redirect. Error: {}",
                    operation, url, e
                )
            } else {
                format!(
                    "Failed to {} for {}: {}. Debug details: {}",
                    operation, url, display_str, debug_str
                )
            }
        }
    }

    /// Default headers plus the current trace context.
    fn request_headers(&self) -> HeaderMap {
        use opentelemetry::global;
        use opentelemetry::Context;

        struct HeaderInjector {
            headers: HeaderMap,
        }
        impl opentelemetry::propagation::Injector for HeaderInjector {
            fn set(&mut self, key: &str, value: String) {
                if let Ok(header_name) = reqwest::header::HeaderName::from_bytes(key.as_bytes()) {
                    if let Ok(header_value) = HeaderValue::from_str(&value) {
                        self.headers.insert(header_name, header_value);
                    }
                }
            }
        }

        let mut injector = HeaderInjector {
            headers: self.default_headers.clone(),
        };
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&Context::current(), &mut injector);
        });
        injector.headers
    }

    /// GET `url` and return the body of a 2xx response.
    ///
    /// Non-success statuses become `Remote` failures carrying the body and
    /// the response headers with lowercased names.
    async fn get_text(&self, url: &str, operation: &str) -> std::result::Result<String, ServiceFailure> {
        let response = self
            .client
            .get(url)
            .headers(self.request_headers())
            .send()
            .await
            .map_err(|e| {
                let error_msg = Self::format_reqwest_error(&e, url, operation);
                error!("[WebApiClient] {}", error_msg);
                ServiceFailure::transport(error_msg)
            })?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(|e| {
            let error_msg = Self::format_reqwest_error(&e, url, "read response body");
            error!("[WebApiClient] {}", error_msg);
            ServiceFailure::transport(error_msg)
        })?;

        if status.is_success() {
            debug!(
                "[WebApiClient] {} succeeded: status={}, body_length={}",
                operation,
                status.as_u16(),
                body.len()
            );
            return Ok(body);
        }

        let detail = error_message(&body).unwrap_or_else(|| {
            if body.chars().count() > BODY_PREVIEW_CHARS {
                format!(
                    "{}... (truncated)",
                    body.chars().take(BODY_PREVIEW_CHARS).collect::<String>()
                )
            } else {
                body.clone()
            }
        });
        error!(
            "[WebApiClient] HTTP {} error from {}: {}",
            status.as_u16(),
            url,
            detail
        );

        let mut failure = ServiceFailure::remote(
            status.as_u16(),
            format!("HTTP {} error from {}: {}", status.as_u16(), url, detail),
        );
        for (name, value) in headers {
            failure = failure.with_header(&name, value);
        }
        Err(failure.with_body(body))
    }
}

#[async_trait]
impl EntityService for WebApiClient {
    #[tracing::instrument(skip(self))]
    async fn retrieve_multiple(
        &self,
        collection: &str,
        query: &str,
    ) -> std::result::Result<RetrievedPage, ServiceFailure> {
        let url = self.collection_url(collection, query);
        let body = self.get_text(&url, "retrieve records").await?;
        let page = parse_collection_page(&body).map_err(|failure| {
            error!(
                "[WebApiClient] Failed to parse collection response: {} - Response: {}",
                failure.message,
                body.chars().take(200).collect::<String>()
            );
            failure
        })?;
        debug!(
            "[WebApiClient] Retrieved {} rows from {} (more: {})",
            page.rows.len(),
            collection,
            page.next_link.is_some()
        );
        Ok(page)
    }

    #[tracing::instrument(skip(self))]
    async fn retrieve_entity_definition(
        &self,
        logical_name: &str,
    ) -> std::result::Result<EntityDefinition, ServiceFailure> {
        let entity_body = self
            .get_text(&self.definition_url(logical_name), "retrieve entity metadata")
            .await?;
        let lookups_body = self
            .get_text(&self.lookups_url(logical_name), "retrieve lookup metadata")
            .await?;

        let definition = parse_entity_definition(&entity_body, Some(&lookups_body))?;
        info!(
            "[WebApiClient] Loaded metadata for {} ({} attributes)",
            definition.logical_name,
            definition.attributes.len()
        );
        Ok(definition)
    }
}
