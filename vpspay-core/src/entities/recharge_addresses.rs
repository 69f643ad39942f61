use crate::chain::Address;
use crate::framework::DatabaseProcessor;
use kanau::processor::Processor;

/// Custodial deposit address assigned to a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RechargeAddress {
    pub address: Address,
    pub user_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RechargeAddressRow {
    pub address: String,
    pub user_id: String,
}

impl TryFrom<RechargeAddressRow> for RechargeAddress {
    type Error = super::RowDecodeError;

    fn try_from(row: RechargeAddressRow) -> Result<Self, Self::Error> {
        Ok(Self {
            address: row
                .address
                .parse()
                .map_err(|e| super::RowDecodeError::new("address", e))?,
            user_id: row.user_id,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListRechargeAddresses;

impl Processor<ListRechargeAddresses> for DatabaseProcessor {
    type Output = Vec<RechargeAddressRow>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ListRechargeAddresses")]
    async fn process(
        &self,
        _query: ListRechargeAddresses,
    ) -> Result<Vec<RechargeAddressRow>, sqlx::Error> {
        sqlx::query_as::<_, RechargeAddressRow>(
            "SELECT address, user_id FROM recharge_addresses ORDER BY address",
        )
        .fetch_all(&self.pool)
        .await
    }
}

#[derive(Debug, Clone)]
pub struct UpsertRechargeAddress {
    pub binding: RechargeAddress,
}

impl Processor<UpsertRechargeAddress> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:UpsertRechargeAddress")]
    async fn process(&self, upsert: UpsertRechargeAddress) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO recharge_addresses (address, user_id) VALUES ($1, $2) \
             ON CONFLICT (address) DO UPDATE SET user_id = EXCLUDED.user_id",
        )
        .bind(upsert.binding.address.to_hex())
        .bind(upsert.binding.user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
