//! Declarative propagation: policies registered per class or method, and
//! the [`Propagator`] that applies them around async bodies.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::db::{Database, DatabaseError};
use crate::propagation::ambient::{self, AmbientFrame, BoundTransaction};
use crate::propagation::dispatch::{decide, Decision};
use crate::propagation::error::{UsageError, UsageResult};
use crate::transaction::{TransactionError, TransactionHandle, TransactionStatus};
use crate::types::{caller_key, PropagateOptions, PropagationType, RowLockLevel, ScopeKey, TransactionId};

/// Propagation policy of a class or method.
///
/// Lock levels left unset fall back to the data source configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transactional {
    pub propagation: PropagationType,
    pub read_row_lock_level: Option<RowLockLevel>,
    pub write_row_lock_level: Option<RowLockLevel>,
}

impl Transactional {
    pub fn new(propagation: PropagationType) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    pub fn required() -> Self {
        Self::new(PropagationType::Required)
    }

    pub fn requires_new() -> Self {
        Self::new(PropagationType::RequiresNew)
    }

    pub fn supports() -> Self {
        Self::new(PropagationType::Supports)
    }

    pub fn mandatory() -> Self {
        Self::new(PropagationType::Mandatory)
    }

    pub fn not_supported() -> Self {
        Self::new(PropagationType::NotSupported)
    }

    pub fn never() -> Self {
        Self::new(PropagationType::Never)
    }

    pub fn read_lock(mut self, level: RowLockLevel) -> Self {
        self.read_row_lock_level = Some(level);
        self
    }

    pub fn write_lock(mut self, level: RowLockLevel) -> Self {
        self.write_row_lock_level = Some(level);
        self
    }
}

/// What a policy is declared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTarget {
    class_name: String,
    method: Option<String>,
    is_async: bool,
    path: Option<String>,
}

impl MethodTarget {
    /// Every async method of `class_name`.
    pub fn class(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method: None,
            is_async: true,
            path: None,
        }
    }

    pub fn method(class_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            ..Self::class(class_name)
        }
    }

    /// Mark the target as synchronous, which cannot be wrapped.
    pub fn blocking(mut self) -> Self {
        self.is_async = false;
        self
    }

    /// Source location, carried into the propagate options for diagnostics.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn describe(&self) -> String {
        match &self.method {
            Some(m) => caller_key(&self.class_name, m),
            None => self.class_name.clone(),
        }
    }

    fn validate(&self) -> UsageResult<()> {
        if self.class_name.trim().is_empty() {
            return Err(UsageError::InvalidTarget("class name is empty".into()));
        }
        match &self.method {
            Some(m) if m.trim().is_empty() => Err(UsageError::InvalidTarget(format!(
                "method name is empty on {}",
                self.class_name
            ))),
            _ if !self.is_async => Err(UsageError::NotAsync {
                target: self.describe(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct Declaration {
    policy: Transactional,
    path: Option<String>,
}

/// Registered policies. Method-level declarations win over class-level.
///
/// Declaration errors are raised here, at registration, never at call
/// time.
#[derive(Default)]
pub struct InterceptorRegistry {
    classes: RwLock<HashMap<String, Declaration>>,
    methods: RwLock<HashMap<String, Declaration>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: MethodTarget, policy: Transactional) -> UsageResult<()> {
        target.validate()?;
        let declaration = Declaration {
            policy,
            path: target.path.clone(),
        };

        let (mut map, key) = match &target.method {
            Some(method) => (self.methods.write(), caller_key(&target.class_name, method)),
            None => (self.classes.write(), target.class_name.clone()),
        };
        if map.contains_key(&key) {
            return Err(UsageError::DuplicateDeclaration { target: key });
        }
        log::debug!("registered {} on {}", policy.propagation, key);
        map.insert(key, declaration);
        Ok(())
    }

    pub fn register_class(&self, class_name: &str, policy: Transactional) -> UsageResult<()> {
        self.register(MethodTarget::class(class_name), policy)
    }

    pub fn register_method(&self, class_name: &str, method: &str, policy: Transactional) -> UsageResult<()> {
        self.register(MethodTarget::method(class_name, method), policy)
    }

    /// Effective policy for a call.
    pub fn policy_for(&self, class_name: &str, method: &str) -> Option<Transactional> {
        self.declaration_for(class_name, method).map(|d| d.policy)
    }

    fn declaration_for(&self, class_name: &str, method: &str) -> Option<Declaration> {
        if let Some(d) = self.methods.read().get(&caller_key(class_name, method)) {
            return Some(d.clone());
        }
        self.classes.read().get(class_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len() + self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("classes", &self.classes.read().len())
            .field("methods", &self.methods.read().len())
            .finish()
    }
}

/// Applies propagation policies around async bodies for one data source.
///
/// A body that starts a transaction owns it: `Ok` commits, `Err` rolls
/// back (including open savepoints) and is returned unchanged. An `Ok`
/// from a body whose transaction was already rolled back becomes
/// `TransactionError::RolledBack`. Joining bodies never complete the
/// transaction they joined.
#[derive(Clone)]
pub struct Propagator {
    db: Database,
    interceptors: Arc<InterceptorRegistry>,
}

impl Propagator {
    pub fn new(db: Database) -> Self {
        Self::with_interceptors(db, Arc::new(InterceptorRegistry::new()))
    }

    pub fn with_interceptors(db: Database, interceptors: Arc<InterceptorRegistry>) -> Self {
        Self { db, interceptors }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn interceptors(&self) -> &InterceptorRegistry {
        &self.interceptors
    }

    /// Run `f` under the policy registered for `class_name::method`, or
    /// directly when none is registered.
    pub async fn invoke<F, Fut, T, E>(&self, class_name: &str, method: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DatabaseError>,
    {
        match self.interceptors.declaration_for(class_name, method) {
            Some(declaration) => {
                self.run(declaration.policy, declaration.path, class_name, method, f)
                    .await
            }
            None => f().await,
        }
    }

    /// Run `f` under `policy`.
    pub async fn propagate<F, Fut, T, E>(
        &self,
        policy: Transactional,
        class_name: &str,
        method: &str,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DatabaseError>,
    {
        MethodTarget::method(class_name, method)
            .validate()
            .map_err(|e| E::from(DatabaseError::from(e)))?;
        self.run(policy, None, class_name, method, f).await
    }

    async fn run<F, Fut, T, E>(
        &self,
        policy: Transactional,
        path: Option<String>,
        class_name: &str,
        method: &str,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DatabaseError>,
    {
        let caller = caller_key(class_name, method);
        let frame = ambient::current_frame();
        let options = Arc::new(self.options_for(&policy, path, class_name, method, &caller, &frame));

        let ambient_tx = self.db.ambient_transaction(&frame).map_err(E::from)?;
        let decision = decide(policy.propagation, ambient_tx.as_ref().map(|h| h.id()), &caller)
            .map_err(|e| E::from(DatabaseError::from(e)))?;

        match decision {
            Decision::JoinExisting(tx_id) => {
                let frame = self.frame(frame.scope, options, Some(&tx_id));
                ambient::enter(frame, async move { f().await }).await
            }
            Decision::RunBare => {
                let frame = self.frame(frame.scope, options, None);
                ambient::enter(frame, async move { f().await }).await
            }
            Decision::RunSuspended(hidden) => {
                log::debug!("{} suspends {}", caller, hidden);
                let scope = match &frame.scope {
                    Some(scope) => scope.suspended(),
                    None => ScopeKey::generate(),
                };
                let frame = self.frame(Some(scope), options, None);
                ambient::enter(frame, async move { f().await }).await
            }
            Decision::StartNew => {
                let scope = frame.scope.unwrap_or_else(ScopeKey::generate);
                let handle = self
                    .db
                    .begin_scoped(&scope, options.clone())
                    .await
                    .map_err(E::from)?;
                self.run_owned(&caller, handle, Some(scope), options, f).await
            }
            Decision::StartNested(_) => {
                let Some(parent) = ambient_tx else {
                    return Err(E::from(DatabaseError::Internal(format!(
                        "{} lost its ambient transaction",
                        caller
                    ))));
                };
                let scope = frame.scope.unwrap_or_else(ScopeKey::generate);
                let handle = self
                    .db
                    .begin_nested(&scope, &parent, options.clone())
                    .await
                    .map_err(E::from)?;
                self.run_owned(&caller, handle, Some(scope), options, f).await
            }
        }
    }

    async fn run_owned<F, Fut, T, E>(
        &self,
        caller: &str,
        handle: TransactionHandle,
        scope: Option<ScopeKey>,
        options: Arc<PropagateOptions>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DatabaseError>,
    {
        let frame = self.frame(scope, options, Some(handle.id()));
        match ambient::enter(frame, async move { f().await }).await {
            Ok(value) => {
                if handle.status() == TransactionStatus::RolledBack {
                    log::warn!("{} returned after {} was rolled back", caller, handle.id());
                    return Err(E::from(DatabaseError::from(TransactionError::RolledBack {
                        tx_id: handle.id().clone(),
                    })));
                }
                if let Err(e) = handle.commit().await {
                    log::warn!("{} could not commit {}: {}", caller, handle.id(), e);
                    handle.rollback_on_error().await;
                    return Err(E::from(DatabaseError::from(e)));
                }
                Ok(value)
            }
            Err(e) => {
                log::warn!("{} failed, rolling back {}", caller, handle.id());
                handle.rollback_on_error().await;
                Err(e)
            }
        }
    }

    fn frame(
        &self,
        scope: Option<ScopeKey>,
        options: Arc<PropagateOptions>,
        bound: Option<&TransactionId>,
    ) -> AmbientFrame {
        AmbientFrame {
            scope,
            options: Some(options),
            bound: bound.map(|tx_id| BoundTransaction {
                db_id: self.db.id_arc(),
                tx_id: tx_id.clone(),
            }),
        }
    }

    /// Options for one call. The entry key is inherited from the
    /// outermost decorated call in the chain.
    fn options_for(
        &self,
        policy: &Transactional,
        path: Option<String>,
        class_name: &str,
        method: &str,
        caller: &str,
        frame: &AmbientFrame,
    ) -> PropagateOptions {
        let defaults = &self.db.config().propagation;
        let entry_key = frame
            .options
            .as_ref()
            .and_then(|o| o.entry_key.clone())
            .unwrap_or_else(|| caller.to_string());

        let mut options = PropagateOptions::new(policy.propagation)
            .entry_key(entry_key)
            .caller(class_name, method)
            .read_row_lock_level(policy.read_row_lock_level.unwrap_or(defaults.read_row_lock_level))
            .write_row_lock_level(policy.write_row_lock_level.unwrap_or(defaults.write_row_lock_level));
        if let Some(path) = path {
            options = options.path(path);
        }
        options
    }
}

impl fmt::Debug for Propagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Propagator")
            .field("db", &self.db.id())
            .field("interceptors", &self.interceptors)
            .finish()
    }
}
