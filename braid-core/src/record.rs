//! The record codec: sealed, chained, content-addressed log entries.
//!
//! Three nested objects make up one record:
//!
//! * the *event block*, the postcard-encoded events of one transaction,
//!   sealed with the thread read key;
//! * the *header*, a fresh one-time key plus the event block's CID, also
//!   sealed with the read key;
//! * the *record envelope*, linking `prev`, the header and body CIDs, and
//!   the author's signature with public key, sealed with the service key.
//!
//! The record's canonical CID is computed over the sealed envelope bytes,
//! so it exists only after sealing. Followers holding the service key but
//! not the read key can verify and replicate records without opening
//! headers or bodies.

use bytes::Bytes;
use cid::Cid;
use libp2p_identity::PublicKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::block::BlockStore;
use crate::content::content_cid;
use crate::error::Error;
use crate::event::Event;
use crate::key::{LogKeypair, ReadKey, ServiceKey};
use crate::thread::LogId;

/// Decrypted header contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Fresh single-use key minted for this record.
    pub one_time_key: [u8; 32],
    /// Content address of the sealed event block.
    pub body: Cid,
}

/// Decrypted record envelope contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    prev: Option<Cid>,
    header: Cid,
    body: Cid,
    sig: Vec<u8>,
    pub_key: Vec<u8>,
}

/// A verified-decodable record: the sealed envelope bytes plus the
/// decrypted links. Immutable once sealed.
#[derive(Debug, Clone)]
pub struct Record {
    cid: Cid,
    sealed: Bytes,
    envelope: Envelope,
}

impl Record {
    /// Seal a new record chaining onto `prev` and store all three blocks.
    ///
    /// Returns the record; its CID is the new log head candidate.
    pub async fn create(
        blocks: &dyn BlockStore,
        keypair: &LogKeypair,
        service_key: &ServiceKey,
        read_key: &ReadKey,
        prev: Option<Cid>,
        events: &[Event],
    ) -> Result<Record, Error> {
        let body_plain = postcard::to_stdvec(&events)?;
        let body = blocks
            .put(Bytes::from(read_key.cipher().seal(&body_plain)))
            .await?;

        let mut one_time_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut one_time_key);
        let header_plain = postcard::to_stdvec(&RecordHeader { one_time_key, body })?;
        let header = blocks
            .put(Bytes::from(read_key.cipher().seal(&header_plain)))
            .await?;

        let sig = keypair
            .sign(&sign_payload(prev.as_ref(), &header, &body))
            .map_err(|_| Error::InvalidSignature)?;
        let envelope = Envelope {
            prev,
            header,
            body,
            sig,
            pub_key: keypair.public().encode_protobuf(),
        };
        let sealed = Bytes::from(service_key.cipher().seal(&postcard::to_stdvec(&envelope)?));
        let cid = blocks.put(sealed.clone()).await?;

        Ok(Record {
            cid,
            sealed,
            envelope,
        })
    }

    /// Open a sealed record envelope received from a peer or loaded from
    /// the block store.
    ///
    /// Fails with [`Error::UnauthorizedRecord`] when the service key does
    /// not open the envelope.
    pub fn from_sealed(service_key: &ServiceKey, sealed: Bytes) -> Result<Record, Error> {
        let plain = service_key
            .cipher()
            .open(&sealed)
            .map_err(|_| Error::UnauthorizedRecord)?;
        let envelope: Envelope = postcard::from_bytes(&plain)?;
        let cid = content_cid(&sealed);
        Ok(Record {
            cid,
            sealed,
            envelope,
        })
    }

    /// The canonical content address of the sealed record.
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// The sealed envelope bytes, as stored and shipped.
    pub fn sealed(&self) -> &Bytes {
        &self.sealed
    }

    /// The previous record in this log, or `None` for the first.
    pub fn prev(&self) -> Option<Cid> {
        self.envelope.prev
    }

    /// Content address of the sealed header block.
    pub fn header_cid(&self) -> Cid {
        self.envelope.header
    }

    /// Content address of the sealed event block.
    pub fn body_cid(&self) -> Cid {
        self.envelope.body
    }

    /// The author's public key attached to the envelope.
    pub fn author(&self) -> Result<PublicKey, Error> {
        PublicKey::try_decode_protobuf(&self.envelope.pub_key)
            .map_err(|_| Error::InvalidSignature)
    }

    /// The log this record claims to belong to.
    pub fn log_id(&self) -> Result<LogId, Error> {
        Ok(LogId::from_public_key(&self.author()?))
    }

    /// Verify the author signature against the stored log public key.
    ///
    /// The attached key must match `log_key` exactly; a record signed by a
    /// different keypair is rejected even if self-consistent.
    pub fn verify(&self, log_key: &PublicKey) -> Result<(), Error> {
        let attached = self.author()?;
        if attached != *log_key {
            return Err(Error::InvalidSignature);
        }
        let payload = sign_payload(
            self.envelope.prev.as_ref(),
            &self.envelope.header,
            &self.envelope.body,
        );
        if !log_key.verify(&payload, &self.envelope.sig) {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }

    /// Fetch and open the header block. Requires the thread read key.
    pub async fn open_header(
        &self,
        blocks: &dyn BlockStore,
        read_key: &ReadKey,
    ) -> Result<RecordHeader, Error> {
        let sealed = blocks
            .get(&self.envelope.header)
            .await?
            .ok_or(Error::BlockNotFound(self.envelope.header))?;
        let plain = read_key.cipher().open(&sealed)?;
        Ok(postcard::from_bytes(&plain)?)
    }

    /// Fetch and open the event block. Requires the thread read key.
    pub async fn open_events(
        &self,
        blocks: &dyn BlockStore,
        read_key: &ReadKey,
    ) -> Result<Vec<Event>, Error> {
        let sealed = blocks
            .get(&self.envelope.body)
            .await?
            .ok_or(Error::BlockNotFound(self.envelope.body))?;
        let plain = read_key.cipher().open(&sealed)?;
        Ok(postcard::from_bytes(&plain)?)
    }
}

fn sign_payload(prev: Option<&Cid>, header: &Cid, body: &Cid) -> Vec<u8> {
    let mut payload = Vec::new();
    if let Some(prev) = prev {
        payload.extend_from_slice(&prev.to_bytes());
    }
    payload.extend_from_slice(&header.to_bytes());
    payload.extend_from_slice(&body.to_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockStore;
    use crate::event::{EventKind, InstanceId};

    fn events() -> Vec<Event> {
        vec![Event {
            collection: "books".into(),
            instance: InstanceId::new_random(),
            kind: EventKind::Create,
            time: 7,
            patch: Bytes::from_static(b"{\"_id\":\"a\",\"title\":\"T\"}"),
        }]
    }

    #[tokio::test]
    async fn round_trip_record() {
        let blocks = MemBlockStore::new();
        let keypair = LogKeypair::generate();
        let service = ServiceKey::generate();
        let read = ReadKey::generate();
        let events = events();

        let record = Record::create(&blocks, &keypair, &service, &read, None, &events)
            .await
            .unwrap();

        // As received over the wire: sealed bytes only.
        let received = Record::from_sealed(&service, record.sealed().clone()).unwrap();
        assert_eq!(received.cid(), record.cid());
        assert_eq!(received.prev(), None);
        received.verify(&keypair.public()).unwrap();

        let header = received.open_header(&blocks, &read).await.unwrap();
        assert_eq!(header.body, received.body_cid());
        let opened = received.open_events(&blocks, &read).await.unwrap();
        assert_eq!(opened, events);
    }

    #[tokio::test]
    async fn chained_record_links_prev() {
        let blocks = MemBlockStore::new();
        let keypair = LogKeypair::generate();
        let service = ServiceKey::generate();
        let read = ReadKey::generate();

        let first = Record::create(&blocks, &keypair, &service, &read, None, &events())
            .await
            .unwrap();
        let second = Record::create(
            &blocks,
            &keypair,
            &service,
            &read,
            Some(first.cid()),
            &events(),
        )
        .await
        .unwrap();
        assert_eq!(second.prev(), Some(first.cid()));
    }

    #[tokio::test]
    async fn wrong_service_key_is_unauthorized() {
        let blocks = MemBlockStore::new();
        let keypair = LogKeypair::generate();
        let record = Record::create(
            &blocks,
            &keypair,
            &ServiceKey::generate(),
            &ReadKey::generate(),
            None,
            &events(),
        )
        .await
        .unwrap();

        let err = Record::from_sealed(&ServiceKey::generate(), record.sealed().clone())
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedRecord));
    }

    #[tokio::test]
    async fn verify_rejects_foreign_key() {
        let blocks = MemBlockStore::new();
        let keypair = LogKeypair::generate();
        let service = ServiceKey::generate();
        let record = Record::create(
            &blocks,
            &keypair,
            &service,
            &ReadKey::generate(),
            None,
            &events(),
        )
        .await
        .unwrap();

        let other = LogKeypair::generate();
        assert!(matches!(
            record.verify(&other.public()),
            Err(Error::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn body_stays_sealed_without_read_key() {
        let blocks = MemBlockStore::new();
        let keypair = LogKeypair::generate();
        let service = ServiceKey::generate();
        let read = ReadKey::generate();
        let record = Record::create(&blocks, &keypair, &service, &read, None, &events())
            .await
            .unwrap();

        let wrong = ReadKey::generate();
        assert!(record.open_events(&blocks, &wrong).await.is_err());
    }
}
