//! Typed clients for the read endpoints the services call on each other.
//!
//! Both wrap a [`ServiceClient`], so each downstream has its own breaker and
//! timeout. `Ok(None)` means the downstream answered success with no data;
//! a `code != 200` reply arrives as [`DegradedReason::BusinessRejected`].

use crate::client::{DegradedReason, ServiceClient};
use parkflow_core::model::{ActiveParkingRecord, OwnerProfile, UserId};

/// `GET /user/owners/{userId}` on user-service.
#[derive(Clone, Debug)]
pub struct UserDirectoryClient {
    client: ServiceClient,
}

impl UserDirectoryClient {
    /// Client over a user-service [`ServiceClient`].
    #[must_use]
    pub const fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    /// The underlying client (for its breaker state).
    #[must_use]
    pub const fn inner(&self) -> &ServiceClient {
        &self.client
    }

    /// Look up an owner.
    ///
    /// # Errors
    ///
    /// [`DegradedReason::BusinessRejected`] when user-service refuses (unknown
    /// owner), [`DegradedReason::Unavailable`] when it cannot be asked.
    pub async fn owner(
        &self,
        user_id: UserId,
        correlation_id: Option<&str>,
    ) -> Result<Option<OwnerProfile>, DegradedReason> {
        self.client
            .get(&format!("/user/owners/{user_id}"), &[], correlation_id)
            .await
    }
}

/// `GET /parking/owner/record?userId=` on parking-service.
#[derive(Clone, Debug)]
pub struct ParkingDirectoryClient {
    client: ServiceClient,
}

impl ParkingDirectoryClient {
    /// Client over a parking-service [`ServiceClient`].
    #[must_use]
    pub const fn new(client: ServiceClient) -> Self {
        Self { client }
    }

    /// The underlying client (for its breaker state).
    #[must_use]
    pub const fn inner(&self) -> &ServiceClient {
        &self.client
    }

    /// The owner's active assignment.
    ///
    /// # Errors
    ///
    /// [`DegradedReason::BusinessRejected`] when parking-service reports no
    /// active record, [`DegradedReason::Unavailable`] when it cannot be asked.
    pub async fn active_record(
        &self,
        user_id: UserId,
        correlation_id: Option<&str>,
    ) -> Result<Option<ActiveParkingRecord>, DegradedReason> {
        self.client
            .get("/parking/owner/record", &[("userId", user_id.to_string())], correlation_id)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::client::{Transport, TransportError, TransportRequest, TransportResponse};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Echo {
        body: &'static str,
        seen: Mutex<Vec<TransportRequest>>,
    }

    #[async_trait]
    impl Transport for Echo {
        async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: 200,
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    fn service(name: &'static str, body: &'static str) -> (ServiceClient, Arc<Echo>) {
        let echo = Arc::new(Echo {
            body,
            seen: Mutex::new(Vec::new()),
        });
        let client = ServiceClient::new(
            name,
            "http://downstream",
            Arc::clone(&echo) as Arc<dyn Transport>,
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
        );
        (client, echo)
    }

    #[tokio::test]
    async fn owner_lookup_hits_owner_path() {
        let (client, echo) = service(
            "user-service",
            r#"{"code":200,"message":"success","data":{"userId":7,"ownerName":"Li","phone":null,"userType":"NORMAL"}}"#,
        );
        let owner = UserDirectoryClient::new(client).owner(UserId::new(7), None).await.unwrap().unwrap();

        assert_eq!(owner.user_id, UserId::new(7));
        assert_eq!(echo.seen.lock().unwrap()[0].url, "http://downstream/user/owners/7");
    }

    #[tokio::test]
    async fn active_record_passes_user_as_query() {
        let (client, echo) = service(
            "parking-service",
            r#"{"code":200,"message":"success","data":{"userId":7,"parkId":3,"parkNum":"A-03","carNum":"B-1234"}}"#,
        );
        let record = ParkingDirectoryClient::new(client)
            .active_record(UserId::new(7), Some("req-1"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.park_id.get(), 3);
        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[0].url, "http://downstream/parking/owner/record");
        assert_eq!(seen[0].query, vec![("userId".to_string(), "7".to_string())]);
    }
}
