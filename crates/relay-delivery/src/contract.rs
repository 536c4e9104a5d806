//! Destination bridge contract calls.

use crate::DeliveryError;
use alloy_sol_types::{sol, SolCall};
use relay_chain::ChainConnection;
use relay_types::{Address, BlockTag, Bytes, StatefulBundle, B256};
use std::sync::Arc;

sol! {
	/// Destination bridge entry points used by the relay.
	interface IBridge {
		/// Transaction hash that included `bundleHash`, or zero.
		function actionMap(bytes32 bundleHash) external view returns (bytes32);

		function submitBundle(
			bytes32 sourceBlockHash,
			bytes32[] sourceTransactionHashes,
			address[] recipients,
			uint128[] amounts,
			bytes[] signatures
		) external;
	}
}

/// Encodes the `submitBundle` call for a signed bundle.
pub fn encode_submit_bundle(bundle: &StatefulBundle) -> Bytes {
	let transfers = bundle.transfers();
	IBridge::submitBundleCall {
		sourceBlockHash: *bundle.bundle().source_block_hash(),
		sourceTransactionHashes: transfers.iter().map(|t| t.source_tx_hash).collect(),
		recipients: transfers.iter().map(|t| t.recipient).collect(),
		amounts: transfers.iter().map(|t| t.amount).collect(),
		signatures: bundle
			.signatures()
			.iter()
			.map(|s| s.signature.clone())
			.collect(),
	}
	.abi_encode()
	.into()
}

/// Encodes the `actionMap` lookup for a bundle hash.
pub fn encode_action_map(bundle_hash: B256) -> Bytes {
	IBridge::actionMapCall {
		bundleHash: bundle_hash,
	}
	.abi_encode()
	.into()
}

/// Read access to the destination bridge contract.
#[derive(Clone)]
pub struct BridgeContract {
	connection: Arc<dyn ChainConnection>,
	address: Address,
}

impl BridgeContract {
	pub fn new(connection: Arc<dyn ChainConnection>, address: Address) -> Self {
		Self {
			connection,
			address,
		}
	}

	pub fn address(&self) -> Address {
		self.address
	}

	/// Looks up the transaction that included `bundle_hash` on the destination
	/// chain. `None` when the contract has no record of it.
	pub async fn included_tx_hash(&self, bundle_hash: B256) -> Result<Option<B256>, DeliveryError> {
		let data = encode_action_map(bundle_hash);
		let output = self
			.connection
			.contract_call(self.address, data, BlockTag::Latest)
			.await?;
		let decoded = IBridge::actionMapCall::abi_decode_returns(&output, true)
			.map_err(|e| DeliveryError::Network(format!("Invalid actionMap response: {}", e)))?;

		Ok(Some(decoded._0).filter(|hash| !hash.is_zero()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_chain::testing::MockConnection;
	use relay_types::{Bundle, BundleSignature, Transfer};

	fn signed_bundle() -> StatefulBundle {
		let transfers = vec![
			Transfer::new(B256::repeat_byte(1), Address::repeat_byte(0x11), 5),
			Transfer::new(B256::repeat_byte(2), Address::repeat_byte(0x22), 7),
		];
		let mut bundle = StatefulBundle::new(3, Bundle::new(9, B256::repeat_byte(9), 0, transfers));
		bundle.set_stored().unwrap();
		bundle
			.set_signed(vec![BundleSignature {
				signer: Address::repeat_byte(0x33),
				signature: Bytes::from(vec![7u8; 65]),
			}])
			.unwrap();
		bundle
	}

	#[test]
	fn test_submit_bundle_encoding_round_trips() {
		let bundle = signed_bundle();
		let encoded = encode_submit_bundle(&bundle);
		assert_eq!(&encoded[..4], IBridge::submitBundleCall::SELECTOR.as_slice());

		let call = IBridge::submitBundleCall::abi_decode(&encoded, true).unwrap();
		assert_eq!(call.sourceBlockHash, B256::repeat_byte(9));
		assert_eq!(call.recipients, vec![Address::repeat_byte(0x11), Address::repeat_byte(0x22)]);
		assert_eq!(call.amounts, vec![5u128, 7u128]);
		assert_eq!(call.signatures.len(), 1);
	}

	#[tokio::test]
	async fn test_included_tx_hash_zero_means_absent() {
		let conn = Arc::new(MockConnection::new("dest"));
		let contract = BridgeContract::new(conn.clone(), Address::repeat_byte(0xbb));
		let bundle_hash = B256::repeat_byte(0x44);

		assert_eq!(contract.included_tx_hash(bundle_hash).await.unwrap(), None);

		let query: Bytes = IBridge::actionMapCall {
			bundleHash: bundle_hash,
		}
		.abi_encode()
		.into();
		conn.set_call_result(query, Bytes::from(B256::repeat_byte(0x55).to_vec()));
		assert_eq!(
			contract.included_tx_hash(bundle_hash).await.unwrap(),
			Some(B256::repeat_byte(0x55))
		);
	}
}
