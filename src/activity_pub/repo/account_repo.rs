use anyhow::{Context, Result, anyhow};
use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use fjall::{Batch, Keyspace, PartitionCreateOptions, PartitionHandle};
use minicbor::{Decode, Encode};

/// Argon2id hash in PHC format; the salt and parameters travel inside the
/// string.
pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| anyhow!("failed to hash password: {error}"))
}

/// Check a password against a stored PHC string.
pub(crate) fn verify_password(password: &str, phc: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(phc).map_err(|error| anyhow!("invalid password hash: {error}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Local-only sidecar to an Actor. Holds everything that must never cross
/// the wire: the password hash, the bearer token and the private key. The
/// Actor serializer never sees this record.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub(crate) struct Account {
    #[n(0)]
    pub(crate) username: String,
    /// PHC string produced by the argon2 hasher.
    #[n(1)]
    pub(crate) password_phc: String,
    #[n(2)]
    pub(crate) token: String,
    #[n(3)]
    pub(crate) actor_iri: String,
    #[n(4)]
    pub(crate) inbox: String,
    #[n(5)]
    pub(crate) outbox: String,
    #[n(6)]
    pub(crate) key_iri: String,
    /// PKCS#8 private key.
    #[cbor(n(7), with = "minicbor::bytes")]
    pub(crate) private_key_der: Vec<u8>,
}

/// Accounts keyed by username, with bearer-token and actor-IRI lookups.
#[derive(Clone)]
pub(crate) struct AccountRepo {
    accounts: PartitionHandle,
    tokens: PartitionHandle,
    actors: PartitionHandle,
}

impl AccountRepo {
    pub(crate) fn new(keyspace: Keyspace) -> Result<AccountRepo> {
        let options = PartitionCreateOptions::default();
        let accounts = keyspace.open_partition("accounts", options.clone())?;
        let tokens = keyspace.open_partition("bearer_tokens", options.clone())?;
        let actors = keyspace.open_partition("account_actors", options)?;
        Ok(AccountRepo {
            accounts,
            tokens,
            actors,
        })
    }

    pub(crate) fn insert(&self, b: &mut Batch, account: &Account) -> Result<()> {
        let bytes = minicbor::to_vec(account).context("unable to serialize account")?;
        b.insert(&self.accounts, account.username.as_str(), bytes);
        b.insert(&self.tokens, account.token.as_str(), account.username.as_str());
        b.insert(&self.actors, account.actor_iri.as_str(), account.username.as_str());
        Ok(())
    }

    pub(crate) fn exists(&self, username: &str) -> Result<bool> {
        Ok(self.accounts.contains_key(username)?)
    }

    pub(crate) fn find_by_username(&self, username: &str) -> Result<Option<Account>> {
        if let Some(bytes) = self.accounts.get(username)? {
            let account = minicbor::decode(&bytes).context("unable to deserialize account")?;
            return Ok(Some(account));
        }
        Ok(None)
    }

    pub(crate) fn find_by_token(&self, token: &str) -> Result<Option<Account>> {
        self.find_indirect(&self.tokens, token)
    }

    pub(crate) fn find_by_actor(&self, actor_iri: &str) -> Result<Option<Account>> {
        self.find_indirect(&self.actors, actor_iri)
    }

    fn find_indirect(&self, index: &PartitionHandle, key: &str) -> Result<Option<Account>> {
        if let Some(bytes) = index.get(key)? {
            let username = String::from_utf8(bytes.to_vec())?;
            return self.find_by_username(&username);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use fjall::{Config, Keyspace};
    use tempfile::tempdir;

    use super::{Account, AccountRepo};

    fn sample() -> Account {
        Account {
            username: "alice".into(),
            password_phc: "$argon2id$v=19$m=19456,t=2,p=1$salt$hash".into(),
            token: "5VZxBKHSzcDKO5RqJhd9jD".into(),
            actor_iri: "https://social.example/person/abc".into(),
            inbox: "https://social.example/orderedcollection/in".into(),
            outbox: "https://social.example/orderedcollection/out".into(),
            key_iri: "https://social.example/key/k".into(),
            private_key_der: vec![48, 130, 4, 190],
        }
    }

    #[test]
    fn lookups_by_username_token_and_actor() -> Result<()> {
        let tmp_dir = tempdir()?;
        let keyspace = Keyspace::open(Config::new(tmp_dir.path()).temporary(true))?;
        let repo = AccountRepo::new(keyspace.clone())?;
        let account = sample();

        let mut b = keyspace.batch();
        repo.insert(&mut b, &account)?;
        b.commit()?;

        assert!(repo.exists("alice")?);
        assert_eq!(Some(account.clone()), repo.find_by_username("alice")?);
        assert_eq!(
            Some(account.clone()),
            repo.find_by_token("5VZxBKHSzcDKO5RqJhd9jD")?
        );
        assert_eq!(
            Some(account),
            repo.find_by_actor("https://social.example/person/abc")?
        );
        assert_eq!(None, repo.find_by_token("nope")?);
        Ok(())
    }

    #[test]
    fn password_hash_round_trip() -> Result<()> {
        let phc = super::hash_password("correct-horse-battery-staple")?;
        assert!(phc.starts_with("$argon2"));
        assert!(super::verify_password("correct-horse-battery-staple", &phc)?);
        assert!(!super::verify_password("wrong", &phc)?);
        // salts differ between hashes of the same password
        assert_ne!(phc, super::hash_password("correct-horse-battery-staple")?);
        Ok(())
    }
}
