use std::time::Duration;

use courier_helpers::{
    envelope::{b64_decode, b64_encode, extract_recipient_key, EnvelopeError},
    redis::BusConnection,
    time::{parse_timestamp, Clock},
};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::errors::RouterError;

/// Hash of agent instance UID to the base64-encoded JSON list of recipient
/// keys currently assigned to it. A recipient key appears in at most one
/// instance's list.
pub const UID_RECIP_KEYS_MAP: &str = "uid_recip_keys_map";

/// Hash of recipient key to the agent instance UID that owns it.
pub const RECIP_KEY_UID_MAP: &str = "recip_key_uid_map";

/// Hash of agent instance UID to its last-activity timestamp
/// (ISO-8601 UTC seconds).
pub const UID_LAST_ACCESS_MAP: &str = "uid_last_access_map";

/// Hash of `"<uid>_<recipKey>"` to the count of queued but not yet consumed
/// inbound messages for that pair. The count is advisory, it triggers
/// reassignment and is never used to replay messages.
pub const PENDING_MSG_COUNT_MAP: &str = "uid_recip_key_pending_msg_count";

/// Cursor into the instance UID set for the next round-robin assignment.
pub const ROUND_ROBIN_ITERATOR: &str = "round_robin_iterator";

/// An instance whose last activity is at least this old is considered stale
/// and eligible for reassignment if it still has pending work.
pub const STALE_OWNER_THRESHOLD_SECS: u64 = 15;

// Producers block rather than drop when no agent instances are registered.
const NO_INSTANCE_RETRY_WAIT: Duration = Duration::from_secs(15);

/// The pending-count hash field for an instance/recipient key pair.
pub fn pending_count_field(uid: &str, recip_key: &str) -> String {
    format!("{uid}_{recip_key}")
}

/// Encodes a recipient key list for storage in [`UID_RECIP_KEYS_MAP`].
pub fn encode_recip_keys(keys: &[String]) -> Result<String, RouterError> {
    let raw = serde_json::to_string(keys)
        .map_err(|err| RouterError::Envelope(EnvelopeError::Json(err)))?;
    Ok(b64_encode(raw.as_bytes()))
}

/// Decodes a recipient key list stored in [`UID_RECIP_KEYS_MAP`].
pub fn decode_recip_keys(encoded: &str) -> Result<Vec<String>, RouterError> {
    let raw = b64_decode(encoded)?;
    serde_json::from_slice(&raw).map_err(|err| RouterError::Envelope(EnvelopeError::Json(err)))
}

/// Returns the recipient keys currently assigned to the given instance.
/// An unregistered instance owns no keys.
pub async fn recip_keys_for_uid(
    conn: &mut dyn BusConnection,
    uid: &str,
) -> Result<Vec<String>, RouterError> {
    match conn.hget(UID_RECIP_KEYS_MAP, uid).await? {
        Some(encoded) => decode_recip_keys(&encoded),
        None => Ok(vec![]),
    }
}

/// Selects the next agent instance UID round-robin, skipping
/// `to_ignore_uid` when provided (used during reassignment away from a
/// stale owner).
///
/// Blocks until at least one eligible instance is registered, producers
/// wait for capacity rather than dropping messages.
pub async fn next_uid_round_robin(
    conn: &mut dyn BusConnection,
    to_ignore_uid: Option<&str>,
) -> Result<String, RouterError> {
    loop {
        let mut uids = conn.hkeys(UID_RECIP_KEYS_MAP).await?;
        if let Some(ignore) = to_ignore_uid {
            uids.retain(|uid| uid != ignore);
        }
        if uids.is_empty() {
            info!(
                "no eligible agent instances registered, waiting {}s before retrying",
                NO_INSTANCE_RETRY_WAIT.as_secs()
            );
            sleep(NO_INSTANCE_RETRY_WAIT).await;
            continue;
        }
        // Hash field order is not stable across reads, sort for a
        // deterministic rotation.
        uids.sort();

        let cursor = conn
            .get(ROUND_ROBIN_ITERATOR)
            .await?
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        let index = cursor % uids.len();
        conn.set(ROUND_ROBIN_ITERATOR, &((index + 1) % uids.len()).to_string())
            .await?;
        return Ok(uids[index].clone());
    }
}

/// Assigns a recipient key that has no owner to the next instance in the
/// rotation, registering the ownership in all routing tables with a zeroed
/// pending count.
pub async fn assign_recip_key_to_new_uid(
    conn: &mut dyn BusConnection,
    recip_key: &str,
) -> Result<String, RouterError> {
    let uid = next_uid_round_robin(conn, None).await?;

    let mut keys = recip_keys_for_uid(conn, &uid).await?;
    if !keys.iter().any(|key| key == recip_key) {
        keys.push(recip_key.to_string());
    }
    conn.hset(UID_RECIP_KEYS_MAP, &uid, &encode_recip_keys(&keys)?)
        .await?;
    conn.hset(RECIP_KEY_UID_MAP, recip_key, &uid).await?;
    conn.hset(
        PENDING_MSG_COUNT_MAP,
        &pending_count_field(&uid, recip_key),
        "0",
    )
    .await?;

    debug!("assigned recipient key {recip_key} to instance {uid}");
    Ok(uid)
}

/// Moves a recipient key away from `old_uid` to the next instance in the
/// rotation. The pending count carries over to the new owner through an
/// atomic increment and the old counter is deleted. An owner left with no
/// keys is removed from [`UID_RECIP_KEYS_MAP`].
pub async fn reassign_recip_key_to_uid(
    conn: &mut dyn BusConnection,
    old_uid: &str,
    recip_key: &str,
) -> Result<String, RouterError> {
    let new_uid = next_uid_round_robin(conn, Some(old_uid)).await?;

    let old_keys = recip_keys_for_uid(conn, old_uid)
        .await?
        .into_iter()
        .filter(|key| key != recip_key)
        .collect::<Vec<String>>();
    if old_keys.is_empty() {
        conn.hdel(UID_RECIP_KEYS_MAP, old_uid).await?;
    } else {
        conn.hset(UID_RECIP_KEYS_MAP, old_uid, &encode_recip_keys(&old_keys)?)
            .await?;
    }

    let mut new_keys = recip_keys_for_uid(conn, &new_uid).await?;
    if !new_keys.iter().any(|key| key == recip_key) {
        new_keys.push(recip_key.to_string());
    }
    conn.hset(UID_RECIP_KEYS_MAP, &new_uid, &encode_recip_keys(&new_keys)?)
        .await?;
    conn.hset(RECIP_KEY_UID_MAP, recip_key, &new_uid).await?;

    let old_field = pending_count_field(old_uid, recip_key);
    let carried = conn
        .hget(PENDING_MSG_COUNT_MAP, &old_field)
        .await?
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);
    conn.hdel(PENDING_MSG_COUNT_MAP, &old_field).await?;
    if carried != 0 {
        conn.hincrby(
            PENDING_MSG_COUNT_MAP,
            &pending_count_field(&new_uid, recip_key),
            carried,
        )
        .await?;
    }

    info!("reassigned recipient key {recip_key} from instance {old_uid} to {new_uid}");
    Ok(new_uid)
}

/// Resolves the queue topic for a packed message in mediator mode.
///
/// Extracts the recipient key, routes it to its owning instance (assigning
/// a new owner for unknown keys and reassigning away from stale owners with
/// pending work), increments the pending counter for the pair and returns
/// the recipient-key-suffixed topic to push the message onto.
pub async fn route_payload_recip_key(
    conn: &mut dyn BusConnection,
    clock: &(dyn Clock + Send + Sync),
    payload: &[u8],
    topic: &str,
) -> Result<String, RouterError> {
    let recip_key = extract_recipient_key(payload)?;

    let owner = match conn.hget(RECIP_KEY_UID_MAP, &recip_key).await? {
        Some(uid) => {
            if is_stale(conn, clock, &uid).await? {
                reassign_stale_owner(conn, &uid, &recip_key).await?
            } else {
                uid
            }
        }
        None => assign_recip_key_to_new_uid(conn, &recip_key).await?,
    };

    conn.hincrby(
        PENDING_MSG_COUNT_MAP,
        &pending_count_field(&owner, &recip_key),
        1,
    )
    .await?;

    Ok(format!("{topic}_{recip_key}"))
}

/// An owner is stale when its last-activity entry is missing, unparsable or
/// old enough to cross the staleness threshold.
async fn is_stale(
    conn: &mut dyn BusConnection,
    clock: &(dyn Clock + Send + Sync),
    uid: &str,
) -> Result<bool, RouterError> {
    let last_access = conn.hget(UID_LAST_ACCESS_MAP, uid).await?;
    Ok(match last_access.as_deref().and_then(parse_timestamp) {
        Some(timestamp) => clock.now().saturating_sub(timestamp) >= STALE_OWNER_THRESHOLD_SECS,
        None => true,
    })
}

/// Reassigns every key owned by a stale instance when at least one of its
/// keys has pending messages, returning the new owner of `recip_key`.
/// A stale owner with no pending work keeps its keys, it may simply be
/// idle.
async fn reassign_stale_owner(
    conn: &mut dyn BusConnection,
    stale_uid: &str,
    recip_key: &str,
) -> Result<String, RouterError> {
    let owned = recip_keys_for_uid(conn, stale_uid).await?;

    let mut any_pending = false;
    for key in &owned {
        let count = conn
            .hget(PENDING_MSG_COUNT_MAP, &pending_count_field(stale_uid, key))
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        if count >= 1 {
            any_pending = true;
            break;
        }
    }
    if !any_pending {
        return Ok(stale_uid.to_string());
    }

    let mut owner = stale_uid.to_string();
    for key in &owned {
        let new_uid = reassign_recip_key_to_uid(conn, stale_uid, key).await?;
        if key == recip_key {
            owner = new_uid;
        }
    }
    Ok(owner)
}
