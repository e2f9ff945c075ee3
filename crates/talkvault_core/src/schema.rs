//! Table definitions and the shipped schema migrations.
//!
//! Statements use SQLite column types. Every statement runs through
//! [`Connection::execute_batch`], so the in-memory backend records them
//! instead of interpreting them.

use crate::error::CoreResult;
use crate::migration::{Migration, SchemaVersion};
use talkvault_storage::Connection;

const CREATE_SETTINGS: &str = "CREATE TABLE settings \
    (namespace TEXT NOT NULL, \
    settingKey TEXT NOT NULL, \
    value TEXT NOT NULL, \
    PRIMARY KEY (namespace, settingKey))";

const CREATE_PROFILES: &str = "CREATE TABLE profiles \
    (contextId TEXT NOT NULL, \
    alias TEXT NOT NULL, \
    fullname TEXT, \
    gender INT, \
    country INT, \
    university TEXT, \
    work TEXT, \
    interests TEXT, \
    quote TEXT, \
    profilepic BLOB, \
    PRIMARY KEY (contextId))";

const CREATE_CONTACTS: &str = "CREATE TABLE contacts \
    (contactId TEXT NOT NULL, \
    profilePicture BLOB, \
    alias TEXT NOT NULL, \
    publicKey BLOB, \
    PRIMARY KEY (contactId))";

const CREATE_PENDING_CONTACTS: &str = "CREATE TABLE pendingContacts \
    (pendingContactId TEXT NOT NULL, \
    alias TEXT NOT NULL, \
    profilePicture BLOB, \
    message TEXT, \
    type INT NOT NULL, \
    timestamp BIGINT NOT NULL, \
    publicKey BLOB, \
    PRIMARY KEY (pendingContactId))";

const CREATE_CONTEXTS: &str = "CREATE TABLE contexts \
    (contextId TEXT NOT NULL, \
    name TEXT NOT NULL, \
    color INT NOT NULL, \
    type INT NOT NULL, \
    PRIMARY KEY (contextId))";

const CREATE_CONTEXT_METADATA: &str = "CREATE TABLE contextMetadata \
    (contextId TEXT NOT NULL, \
    metaKey TEXT NOT NULL, \
    value BLOB NOT NULL, \
    PRIMARY KEY (contextId, metaKey), \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const CREATE_CONTEXT_INVITES: &str = "CREATE TABLE contextInvites \
    (contactId TEXT NOT NULL, \
    pendingContextId TEXT NOT NULL, \
    name TEXT NOT NULL, \
    jsonContext TEXT, \
    type INT NOT NULL, \
    incoming BOOLEAN NOT NULL, \
    timestamp BIGINT NOT NULL, \
    PRIMARY KEY (contactId, pendingContextId), \
    FOREIGN KEY (contactId) REFERENCES contacts (contactId) ON DELETE CASCADE)";

const CREATE_GROUPS: &str = "CREATE TABLE \"groups\" \
    (groupId TEXT NOT NULL, \
    contextId TEXT NOT NULL, \
    contactId TEXT, \
    descriptor BLOB, \
    type INT NOT NULL, \
    PRIMARY KEY (groupId), \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const CREATE_GROUP_METADATA: &str = "CREATE TABLE groupMetadata \
    (groupId TEXT NOT NULL, \
    contextId TEXT NOT NULL, \
    metaKey TEXT NOT NULL, \
    value BLOB NOT NULL, \
    PRIMARY KEY (groupId, metaKey), \
    FOREIGN KEY (groupId) REFERENCES \"groups\" (groupId) ON DELETE CASCADE, \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const CREATE_GROUP_INVITES: &str = "CREATE TABLE groupInvites \
    (contactId TEXT NOT NULL, \
    contextId TEXT NOT NULL, \
    pendingGroupId TEXT NOT NULL, \
    name TEXT NOT NULL, \
    json TEXT, \
    type INT NOT NULL, \
    incoming BOOLEAN NOT NULL, \
    timestamp BIGINT NOT NULL, \
    PRIMARY KEY (contactId, pendingGroupId), \
    FOREIGN KEY (contactId) REFERENCES contacts (contactId) ON DELETE CASCADE, \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const CREATE_FORUM_MEMBER_LIST: &str = "CREATE TABLE forumMemberList \
    (groupId TEXT NOT NULL, \
    peerId TEXT NOT NULL, \
    fakeId TEXT, \
    fakename TEXT, \
    alias TEXT, \
    role INT NOT NULL, \
    timestamp BIGINT NOT NULL, \
    PRIMARY KEY (groupId, fakeId), \
    FOREIGN KEY (groupId) REFERENCES \"groups\" (groupId) ON DELETE CASCADE)";

/// `messages` as of version 5, under the given table name.
macro_rules! messages_ddl {
    ($table:literal) => {
        concat!(
            "CREATE TABLE ",
            $table,
            " (messageId TEXT NOT NULL, \
            groupId TEXT NOT NULL, \
            contextId TEXT NOT NULL, \
            timestamp BIGINT NOT NULL, \
            text TEXT, \
            mediaFileName TEXT, \
            type INT NOT NULL, \
            state INT NOT NULL, \
            incoming BOOLEAN NOT NULL, \
            favourite BOOLEAN NOT NULL, \
            temporary BOOLEAN NOT NULL, \
            PRIMARY KEY (messageId), \
            FOREIGN KEY (groupId) REFERENCES \"groups\" (groupId) ON DELETE CASCADE, \
            FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)"
        )
    };
}

const CREATE_MESSAGES: &str = messages_ddl!("messages");

const CREATE_MESSAGE_METADATA: &str = "CREATE TABLE messageMetadata \
    (messageId TEXT NOT NULL, \
    groupId TEXT NOT NULL, \
    metaKey TEXT NOT NULL, \
    value BLOB NOT NULL, \
    PRIMARY KEY (messageId, metaKey), \
    FOREIGN KEY (messageId) REFERENCES messages (messageId) ON DELETE CASCADE, \
    FOREIGN KEY (groupId) REFERENCES \"groups\" (groupId) ON DELETE CASCADE)";

const CREATE_EVENTS: &str = "CREATE TABLE events \
    (eventId TEXT NOT NULL, \
    contextId TEXT NOT NULL, \
    title TEXT NOT NULL, \
    description TEXT, \
    url TEXT, \
    lat REAL, \
    lng REAL, \
    timestamp BIGINT, \
    type INT NOT NULL, \
    PRIMARY KEY (eventId), \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const CREATE_INVERTED_INDEX_V2: &str = "CREATE TABLE inverted_index \
    (entity TEXT NOT NULL, \
    key TEXT NOT NULL, \
    value BLOB NOT NULL, \
    PRIMARY KEY (entity, key))";

const CREATE_INVERTED_INDEX: &str = "CREATE TABLE inverted_index \
    (entity TEXT NOT NULL, \
    contextId TEXT NOT NULL, \
    key TEXT NOT NULL, \
    value BLOB NOT NULL, \
    PRIMARY KEY (entity, contextId, key), \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const DROP_INVERTED_INDEX: &str = "DROP TABLE inverted_index";

const CREATE_GROUP_MEMBERS_V6: &str = "CREATE TABLE groupMembers \
    (peerId TEXT NOT NULL, \
    profilePicture BLOB, \
    alias TEXT NOT NULL, \
    groupId TEXT NOT NULL, \
    PRIMARY KEY (peerId, groupId))";

/// `groupMembers` as of version 8, under the given table name.
macro_rules! group_members_ddl {
    ($table:literal) => {
        concat!(
            "CREATE TABLE ",
            $table,
            " (peerId TEXT NOT NULL, \
            profilePicture BLOB, \
            alias TEXT NOT NULL, \
            groupId TEXT NOT NULL, \
            PRIMARY KEY (peerId, groupId), \
            FOREIGN KEY (groupId) REFERENCES \"groups\" (groupId) ON DELETE CASCADE)"
        )
    };
}

const CREATE_GROUP_MEMBERS: &str = group_members_ddl!("groupMembers");

const CREATE_GROUP_ACCESS_REQUESTS: &str = "CREATE TABLE groupAccessRequests \
    (contactId TEXT NOT NULL, \
    contextId TEXT NOT NULL, \
    pendingGroupId TEXT NOT NULL, \
    name TEXT NOT NULL, \
    type INT NOT NULL, \
    incoming BOOLEAN NOT NULL, \
    timestamp BIGINT NOT NULL, \
    peerName TEXT NOT NULL, \
    PRIMARY KEY (contactId, pendingGroupId), \
    FOREIGN KEY (contextId) REFERENCES contexts (contextId) ON DELETE CASCADE)";

const CREATE_CRYPTO_KEYS: &str = "CREATE TABLE crypto_keys \
    (privateKey BLOB, \
    publicKey BLOB)";

/// Statements creating a fresh store at the current schema version, in
/// dependency order.
///
/// Column order matches what the migrations leave behind, so a fresh store
/// and a migrated one have the same layout.
pub const CREATE_TABLES: &[&str] = &[
    CREATE_SETTINGS,
    CREATE_PROFILES,
    CREATE_CONTACTS,
    CREATE_PENDING_CONTACTS,
    CREATE_CONTEXTS,
    CREATE_CONTEXT_METADATA,
    CREATE_CONTEXT_INVITES,
    CREATE_GROUPS,
    CREATE_GROUP_METADATA,
    CREATE_GROUP_INVITES,
    CREATE_FORUM_MEMBER_LIST,
    CREATE_MESSAGES,
    CREATE_MESSAGE_METADATA,
    CREATE_EVENTS,
    CREATE_INVERTED_INDEX,
    CREATE_GROUP_MEMBERS,
    CREATE_GROUP_ACCESS_REQUESTS,
    CREATE_CRYPTO_KEYS,
];
/// Creates every table of the current schema.
pub(crate) fn create_tables(conn: &mut dyn Connection) -> CoreResult<()> {
    for statement in CREATE_TABLES {
        conn.execute_batch(statement)?;
    }
    Ok(())
}

/// Adds the inverted index.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration1To2;

impl Migration for Migration1To2 {
    fn start_version(&self) -> SchemaVersion {
        1
    }

    fn end_version(&self) -> SchemaVersion {
        2
    }

    fn name(&self) -> &str {
        "add_inverted_index"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(CREATE_INVERTED_INDEX_V2)?;
        Ok(())
    }
}

/// Scopes inverted index entries to a context.
///
/// Existing entries are dropped; the index is rebuilt by its owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration2To3;

impl Migration for Migration2To3 {
    fn start_version(&self) -> SchemaVersion {
        2
    }

    fn end_version(&self) -> SchemaVersion {
        3
    }

    fn name(&self) -> &str {
        "scope_inverted_index_by_context"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(DROP_INVERTED_INDEX)?;
        conn.execute_batch(CREATE_INVERTED_INDEX)?;
        Ok(())
    }
}

/// Keys the forum member list by pseudonym and adds the pseudonym's name.
///
/// Existing rows are dropped; members are re-announced by their groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration3To4;

impl Migration for Migration3To4 {
    fn start_version(&self) -> SchemaVersion {
        3
    }

    fn end_version(&self) -> SchemaVersion {
        4
    }

    fn name(&self) -> &str {
        "key_forum_members_by_fake_id"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch("DROP TABLE forumMemberList")?;
        conn.execute_batch(CREATE_FORUM_MEMBER_LIST)?;
        Ok(())
    }
}

/// Ties messages to their context so deleting a context deletes its
/// messages.
///
/// SQLite cannot add a constraint to an existing table, so `messages` is
/// rebuilt. Dropping the old table cascades into `messageMetadata`, which
/// is saved first and restored afterwards. Messages whose context no longer
/// exists are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration4To5;

impl Migration for Migration4To5 {
    fn start_version(&self) -> SchemaVersion {
        4
    }

    fn end_version(&self) -> SchemaVersion {
        5
    }

    fn name(&self) -> &str {
        "cascade_messages_from_contexts"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(messages_ddl!("messages_new"))?;
        conn.execute_batch(
            "INSERT INTO messages_new SELECT * FROM messages \
             WHERE contextId IN (SELECT contextId FROM contexts)",
        )?;
        conn.execute_batch(
            "CREATE TEMP TABLE saved_message_metadata AS SELECT * FROM messageMetadata",
        )?;
        conn.execute_batch("DROP TABLE messages")?;
        conn.execute_batch("ALTER TABLE messages_new RENAME TO messages")?;
        conn.execute_batch(
            "INSERT INTO messageMetadata SELECT * FROM temp.saved_message_metadata \
             WHERE messageId IN (SELECT messageId FROM messages)",
        )?;
        conn.execute_batch("DROP TABLE temp.saved_message_metadata")?;
        Ok(())
    }
}

/// Adds the per-group member directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration5To6;

impl Migration for Migration5To6 {
    fn start_version(&self) -> SchemaVersion {
        5
    }

    fn end_version(&self) -> SchemaVersion {
        6
    }

    fn name(&self) -> &str {
        "add_group_members"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(CREATE_GROUP_MEMBERS_V6)?;
        Ok(())
    }
}

/// Adds requests to join a group.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration6To7;

impl Migration for Migration6To7 {
    fn start_version(&self) -> SchemaVersion {
        6
    }

    fn end_version(&self) -> SchemaVersion {
        7
    }

    fn name(&self) -> &str {
        "add_group_access_requests"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(CREATE_GROUP_ACCESS_REQUESTS)?;
        Ok(())
    }
}

/// Removes members of deleted groups and ties the member directory to its
/// group. The table is rebuilt to carry the constraint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration7To8;

impl Migration for Migration7To8 {
    fn start_version(&self) -> SchemaVersion {
        7
    }

    fn end_version(&self) -> SchemaVersion {
        8
    }

    fn name(&self) -> &str {
        "cascade_group_members_from_groups"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(
            "DELETE FROM groupMembers WHERE NOT EXISTS \
             (SELECT * FROM \"groups\" AS g WHERE g.groupId = groupMembers.groupId)",
        )?;
        conn.execute_batch(group_members_ddl!("groupMembers_new"))?;
        conn.execute_batch("INSERT INTO groupMembers_new SELECT * FROM groupMembers")?;
        conn.execute_batch("DROP TABLE groupMembers")?;
        conn.execute_batch("ALTER TABLE groupMembers_new RENAME TO groupMembers")?;
        Ok(())
    }
}

/// Adds the local key pair and public keys for contacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Migration8To9;

impl Migration for Migration8To9 {
    fn start_version(&self) -> SchemaVersion {
        8
    }

    fn end_version(&self) -> SchemaVersion {
        9
    }

    fn name(&self) -> &str {
        "add_public_keys"
    }

    fn migrate(&self, conn: &mut dyn Connection) -> CoreResult<()> {
        conn.execute_batch(CREATE_CRYPTO_KEYS)?;
        conn.execute_batch("ALTER TABLE contacts ADD COLUMN publicKey BLOB")?;
        conn.execute_batch("ALTER TABLE pendingContacts ADD COLUMN publicKey BLOB")?;
        Ok(())
    }
}
