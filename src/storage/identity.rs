use super::kv_store::KeyValueStore;
use crate::common::Participant;
use crate::error::StoreError;

const NAME_KEY: &str = "userName";
const CONTACT_KEY: &str = "userPhone";

/// Persists the local participant across restarts.
pub struct IdentityStore {
    store: Box<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns the saved participant when both fields are present.
    pub fn load(&self) -> Result<Option<Participant>, StoreError> {
        let name = self.store.get(NAME_KEY)?.unwrap_or_default();
        let contact = self.store.get(CONTACT_KEY)?.unwrap_or_default();
        if name.is_empty() || contact.is_empty() {
            return Ok(None);
        }
        Ok(Some(Participant::new(name, contact)))
    }

    pub fn save(&self, participant: &Participant) -> Result<(), StoreError> {
        self.store.set(NAME_KEY, &participant.display_name)?;
        self.store.set(CONTACT_KEY, &participant.contact_id)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove(NAME_KEY)?;
        self.store.remove(CONTACT_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteKeyValueStore;

    fn identity_store() -> IdentityStore {
        IdentityStore::new(Box::new(SqliteKeyValueStore::in_memory().unwrap()))
    }

    #[test]
    fn save_then_load_round_trips_participant() {
        let identity = identity_store();
        assert_eq!(identity.load().unwrap(), None);

        let me = Participant::new("Amina", "111");
        identity.save(&me).unwrap();
        assert_eq!(identity.load().unwrap(), Some(me));

        identity.clear().unwrap();
        assert_eq!(identity.load().unwrap(), None);
    }

    #[test]
    fn half_saved_identity_is_ignored() {
        let kv = SqliteKeyValueStore::in_memory().unwrap();
        kv.set(NAME_KEY, "Amina").unwrap();
        let identity = IdentityStore::new(Box::new(kv));

        assert_eq!(identity.load().unwrap(), None);
    }
}
