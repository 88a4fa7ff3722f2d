use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Encodable, RlpEncodable};

/// The destination of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TxKind {
    /// A message call to an existing account.
    Call(Address),
    /// Contract creation via the `CREATE` scheme: the deployed address is
    /// derived from `(sender, nonce)`.
    Create,
    /// Contract creation via the `CREATE2` scheme: the deployed address is
    /// derived from `(sender, salt, keccak256(init_code))`.
    Create2(B256),
}

impl TxKind {
    /// Returns the call target, if any.
    pub fn to(&self) -> Option<Address> {
        match self {
            Self::Call(address) => Some(*address),
            Self::Create | Self::Create2(_) => None,
        }
    }

    /// Returns `true` for either creation scheme.
    pub fn is_create(&self) -> bool {
        !matches!(self, Self::Call(_))
    }
}

/// A transaction message as consumed by the execution stage.
///
/// Signature recovery happens upstream (sender-recovery is an external
/// collaborator), so the sender is carried in the clear and `hash` commits
/// to the message fields only.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transaction {
    /// EIP-2718 transaction type; `0` for legacy.
    pub tx_type: u8,
    /// Recovered sender.
    pub from: Address,
    /// Call target or creation scheme.
    pub to: TxKind,
    /// Sender nonce.
    pub nonce: u64,
    /// Gas limit for this transaction.
    pub gas_limit: u64,
    /// Value transferred in wei.
    pub value: U256,
    /// Call data or init code.
    pub input: Bytes,
}

impl Transaction {
    /// Hash identifying this transaction.
    pub fn hash(&self) -> B256 {
        #[derive(RlpEncodable)]
        struct Message<'a> {
            tx_type: u8,
            from: Address,
            to: Address,
            nonce: u64,
            gas_limit: u64,
            value: U256,
            input: &'a [u8],
        }
        let mut buf = Vec::new();
        Message {
            tx_type: self.tx_type,
            from: self.from,
            to: self.to.to().unwrap_or_default(),
            nonce: self.nonce,
            gas_limit: self.gas_limit,
            value: self.value,
            input: &self.input,
        }
        .encode(&mut buf);
        keccak256(buf)
    }

    /// The address a creation transaction deploys to, `None` for calls.
    pub fn created_address(&self) -> Option<Address> {
        match self.to {
            TxKind::Call(_) => None,
            TxKind::Create => Some(create_address(self.from, self.nonce)),
            TxKind::Create2(salt) => {
                Some(create2_address(self.from, salt, keccak256(&self.input)))
            }
        }
    }
}

/// `CREATE` address derivation: `keccak256(rlp([sender, nonce]))[12..]`.
pub fn create_address(sender: Address, nonce: u64) -> Address {
    #[derive(RlpEncodable)]
    struct SenderNonce {
        sender: Address,
        nonce: u64,
    }
    let mut buf = Vec::new();
    SenderNonce { sender, nonce }.encode(&mut buf);
    Address::from_slice(&keccak256(buf)[12..])
}

/// `CREATE2` address derivation:
/// `keccak256(0xff ++ sender ++ salt ++ init_code_hash)[12..]`.
pub fn create2_address(sender: Address, salt: B256, init_code_hash: B256) -> Address {
    let mut buf = [0u8; 85];
    buf[0] = 0xff;
    buf[1..21].copy_from_slice(sender.as_slice());
    buf[21..53].copy_from_slice(salt.as_slice());
    buf[53..85].copy_from_slice(init_code_hash.as_slice());
    Address::from_slice(&keccak256(buf)[12..])
}
