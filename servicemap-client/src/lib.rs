pub mod elasticsearch;
pub mod error;
pub mod http;
pub mod kibana;
pub mod result;
pub mod search;

pub use elasticsearch::ElasticsearchClient;
pub use error::ClientError;
pub use kibana::KibanaAlertsClient;
pub use result::{
    AlertParams, AlertState, AlertSummary, Hit, Hits, MlCapabilities, MlJob, SearchRequest,
    SearchResponse,
};
pub use search::{AlertsClient, MlClient, SearchClient};
