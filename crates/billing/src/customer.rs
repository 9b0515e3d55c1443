//! Remote customer resolution
//!
//! Finds or creates the provider customer an invoice is billed to, preferring
//! the id already stored on the contact, then an email match at the provider.

use std::collections::HashMap;

use crate::error::BillingResult;
use crate::provider::{NewRemoteCustomer, PaymentProvider};
use crate::store::{ContactRecord, InvoiceStore};

/// How the customer id was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerSource {
    Stored,
    EmailMatch,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerResolution {
    pub customer_id: String,
    pub source: CustomerSource,
}

/// Who the invoice is addressed to
#[derive(Debug, Clone)]
pub struct BillingParty<'a> {
    pub user_id: i64,
    pub contact: Option<&'a ContactRecord>,
    pub email: &'a str,
    pub name: Option<&'a str>,
}

#[derive(Clone)]
pub struct CustomerService {
    store: InvoiceStore,
}

impl CustomerService {
    pub fn new(store: InvoiceStore) -> Self {
        Self { store }
    }

    /// Resolve the provider customer for `party`, storing the id on the contact
    /// when it changed.
    ///
    /// Not serialized: two concurrent calls for the same contact can both miss
    /// and create duplicate remote customers.
    pub async fn resolve(
        &self,
        provider: &dyn PaymentProvider,
        party: &BillingParty<'_>,
    ) -> BillingResult<CustomerResolution> {
        let stored_id = party
            .contact
            .and_then(|c| c.provider_customer_id.as_deref())
            .filter(|id| !id.is_empty());

        let resolution = match self.lookup(provider, stored_id, party.email).await? {
            Some(resolution) => resolution,
            None => {
                let mut metadata = HashMap::new();
                metadata.insert("user_id".to_string(), party.user_id.to_string());
                if let Some(contact) = party.contact {
                    metadata.insert("contact_id".to_string(), contact.id.to_string());
                }

                let customer = provider
                    .create_customer(NewRemoteCustomer {
                        email: party.email.to_string(),
                        name: party.name.map(str::to_string),
                        metadata,
                    })
                    .await?;

                CustomerResolution {
                    customer_id: customer.id,
                    source: CustomerSource::Created,
                }
            }
        };

        if let Some(contact) = party.contact {
            if stored_id != Some(resolution.customer_id.as_str()) {
                // The remote customer already exists; a failed link is retried
                // through the email match on the next invoice.
                match self
                    .store
                    .set_contact_customer_id(contact.id, &resolution.customer_id)
                    .await
                {
                    Ok(()) => tracing::info!(
                        contact_id = contact.id,
                        customer_id = %resolution.customer_id,
                        source = ?resolution.source,
                        "Linked contact to provider customer"
                    ),
                    Err(e) => tracing::warn!(
                        contact_id = contact.id,
                        customer_id = %resolution.customer_id,
                        error = %e,
                        "Failed to store provider customer on contact"
                    ),
                }
            }
        }

        Ok(resolution)
    }

    async fn lookup(
        &self,
        provider: &dyn PaymentProvider,
        stored_id: Option<&str>,
        email: &str,
    ) -> BillingResult<Option<CustomerResolution>> {
        if let Some(id) = stored_id {
            if let Some(customer) = provider.retrieve_customer(id).await? {
                return Ok(Some(CustomerResolution {
                    customer_id: customer.id,
                    source: CustomerSource::Stored,
                }));
            }
            tracing::warn!(
                customer_id = %id,
                "Stored provider customer missing, falling back to email lookup"
            );
        }

        Ok(provider
            .find_customer_by_email(email)
            .await?
            .map(|customer| CustomerResolution {
                customer_id: customer.id,
                source: CustomerSource::EmailMatch,
            }))
    }
}
