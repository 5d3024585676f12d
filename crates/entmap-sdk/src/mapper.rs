use std::any::{type_name, TypeId};
use std::sync::Arc;

use entmap_store::Datastore;
use entmap_translate::{
    Entity, EntityMetadata, LoadContext, Polymorphic, Registry, SaveContext,
    DISCRIMINATOR_INDEX_PROPERTY, DISCRIMINATOR_PROPERTY,
};
use entmap_types::{Key, Node, Record, Value};
use tracing::debug;

use crate::config::MapperConfig;
use crate::error::{MapperError, MapperResult};
use crate::loader::BatchLoader;

/// Saves and loads registered entities through a [`Datastore`].
///
/// The mapper owns no per-episode state: every call builds its own
/// save or load context, so one mapper may serve many threads.
pub struct Mapper<S> {
    store: S,
    registry: Arc<Registry>,
    config: MapperConfig,
}

impl<S: Datastore> Mapper<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, MapperConfig::default())
    }

    pub fn with_config(store: S, config: MapperConfig) -> Self {
        let registry = Arc::new(Registry::with_config(config.translate.clone()));
        Self::with_registry(store, registry, config)
    }

    /// Share an existing registry, e.g. one with custom factories installed.
    pub fn with_registry(store: S, registry: Arc<Registry>, config: MapperConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Register entity `E` and everything reachable from it.
    ///
    /// Configuration errors surface here. Registering twice returns the
    /// same metadata.
    pub fn register<E: Entity>(&self) -> MapperResult<Arc<EntityMetadata<E>>> {
        Ok(self.registry.register::<E>()?)
    }

    fn metadata<E: Entity>(&self) -> MapperResult<Arc<EntityMetadata<E>>> {
        Ok(self.registry.metadata::<E>()?)
    }

    // ---- Writes ----

    /// Save `entity`. A generated id is written back into it.
    pub fn save<E: Entity>(&self, entity: &mut E) -> MapperResult<Key<E>> {
        let metadata = self.metadata::<E>()?;
        let mut ctx = SaveContext::new(&self.registry);
        let record = metadata.save(entity, &mut ctx)?;
        let key = self.store.put(record)?;
        metadata.set_key(entity, &key)?;
        debug!(
            key = %key,
            references = ctx.references().len(),
            "saved entity"
        );
        Ok(Key::from_raw(key))
    }

    /// Save every entity in one batch. Nothing is written unless all of
    /// them translate.
    ///
    /// The before-save hooks of the whole batch run first, so when one
    /// entity fails to translate every entity has still been through its
    /// hooks. Ids are only written back after the batch is stored.
    pub fn save_all<E: Entity>(&self, entities: &mut [E]) -> MapperResult<Vec<Key<E>>> {
        let metadata = self.metadata::<E>()?;
        for entity in entities.iter_mut() {
            metadata.prepare_save(entity);
        }
        let mut ctx = SaveContext::new(&self.registry);
        let records = entities
            .iter()
            .map(|entity| metadata.to_record(entity, &mut ctx))
            .collect::<Result<Vec<Record>, _>>()?;
        let keys = self.store.put_batch(records)?;
        for (entity, key) in entities.iter_mut().zip(&keys) {
            metadata.set_key(entity, key)?;
        }
        debug!(kind = %metadata.kind(), count = keys.len(), "saved entity batch");
        Ok(keys.into_iter().map(Key::from_raw).collect())
    }

    pub fn delete<E: Entity>(&self, key: &Key<E>) -> MapperResult<bool> {
        Ok(self.store.delete(key.raw())?)
    }

    /// The key `entity` would be saved under; incomplete while its id is
    /// still to be generated.
    pub fn key_of<E: Entity>(&self, entity: &E) -> MapperResult<Key<E>> {
        let metadata = self.metadata::<E>()?;
        Ok(Key::from_raw(metadata.key_of(entity)?))
    }

    // ---- Reads ----

    /// Load one entity with the default load groups.
    pub fn load<E: Entity>(&self, key: &Key<E>) -> MapperResult<Option<E>> {
        let groups = self.config.default_groups.clone();
        self.load_one(key, groups)
    }

    /// Load one entity, fetching references eager in any of `groups`.
    pub fn load_with_groups<E: Entity>(
        &self,
        key: &Key<E>,
        groups: &[&str],
    ) -> MapperResult<Option<E>> {
        let groups = groups.iter().map(|g| g.to_string()).collect();
        self.load_one(key, groups)
    }

    /// Load several entities in one batch, preserving order.
    pub fn load_many<E: Entity>(&self, keys: &[Key<E>]) -> MapperResult<Vec<Option<E>>> {
        let raw: Vec<_> = keys.iter().map(|k| k.raw().clone()).collect();
        let records = self.store.get_batch(&raw)?;
        self.decode(records, self.config.default_groups.clone())
    }

    /// Load every stored entity of `E`'s kind.
    pub fn load_kind<E: Entity>(&self) -> MapperResult<Vec<E>> {
        let metadata = self.metadata::<E>()?;
        let records = self.store.scan_kind(metadata.kind())?;
        self.decode_all(records)
    }

    /// Load every stored member of hierarchy `R` that is a `V`, including
    /// subclasses of `V`.
    ///
    /// An indexed `V` is matched through the `^i` discriminator index; any
    /// other class is matched by comparing stored discriminators.
    pub fn load_subtype<R, V>(&self) -> MapperResult<Vec<R>>
    where
        R: Polymorphic + Entity,
        V: 'static,
    {
        let metadata = self.metadata::<R>()?;
        let hierarchy = self.hierarchy_of::<R>()?;
        let Some(variant) = hierarchy.variant_by_type(TypeId::of::<V>()) else {
            return Err(MapperError::UnknownVariant {
                type_name: type_name::<V>().to_string(),
            });
        };

        let mut records = self.store.scan_kind(metadata.kind())?;
        if variant.type_id != hierarchy.base().type_id {
            if variant.indexed {
                let wanted = Value::String(variant.discriminator.clone());
                records.retain(|r| r.index_contains(DISCRIMINATOR_INDEX_PROPERTY, &wanted));
            } else {
                let base = hierarchy.base().discriminator.clone();
                records.retain(|r| {
                    hierarchy.is_compatible(&stored_discriminator(r, &base), variant.type_id)
                });
            }
        }
        debug!(
            kind = %metadata.kind(),
            discriminator = %variant.discriminator,
            matched = records.len(),
            "query by type"
        );
        self.decode_all(records)
    }

    /// Load entity `key` of hierarchy `R`, requiring it to be stored as a
    /// `V` or a subclass of `V`.
    pub fn load_variant<R, V>(&self, key: &Key<R>) -> MapperResult<Option<R>>
    where
        R: Polymorphic + Entity,
        V: 'static,
    {
        let hierarchy = self.hierarchy_of::<R>()?;
        if hierarchy.variant_by_type(TypeId::of::<V>()).is_none() {
            return Err(MapperError::UnknownVariant {
                type_name: type_name::<V>().to_string(),
            });
        }
        let Some(record) = self.store.get(key.raw())? else {
            return Ok(None);
        };
        let stored = stored_discriminator(&record, &hierarchy.base().discriminator);
        if !hierarchy.is_compatible(&stored, TypeId::of::<V>()) {
            return Err(MapperError::TypeMismatch {
                key: key.raw().clone(),
                expected: type_name::<V>().to_string(),
                found: stored,
            });
        }
        let mut loaded = self.decode::<R>(vec![Some(record)], self.config.default_groups.clone())?;
        Ok(loaded.pop().flatten())
    }

    fn hierarchy_of<R: Polymorphic + Entity>(
        &self,
    ) -> MapperResult<Arc<entmap_translate::Hierarchy>> {
        self.registry
            .hierarchy::<R>()
            .ok_or_else(|| MapperError::UnknownVariant {
                type_name: type_name::<R>().to_string(),
            })
    }

    fn load_one<E: Entity>(&self, key: &Key<E>, groups: Vec<String>) -> MapperResult<Option<E>> {
        let record = self.store.get(key.raw())?;
        let mut loaded = self.decode(vec![record], groups)?;
        Ok(loaded.pop().flatten())
    }

    fn decode_all<E: Entity>(&self, records: Vec<Record>) -> MapperResult<Vec<E>> {
        let records = records.into_iter().map(Some).collect();
        let loaded = self.decode(records, self.config.default_groups.clone())?;
        Ok(loaded.into_iter().flatten().collect())
    }

    /// Decode the roots, resolve their deferred references, then run the
    /// roots' after-load hooks.
    fn decode<E: Entity>(
        &self,
        records: Vec<Option<Record>>,
        groups: Vec<String>,
    ) -> MapperResult<Vec<Option<E>>> {
        let metadata = self.metadata::<E>()?;
        let mut ctx = LoadContext::with_groups(&self.registry, groups.clone());
        let mut roots = records
            .iter()
            .map(|record| {
                record
                    .as_ref()
                    .map(|record| metadata.load(record, &mut ctx))
                    .transpose()
            })
            .collect::<Result<Vec<Option<E>>, _>>()?;

        let pending = ctx.take_pending();
        if !pending.is_empty() {
            let keys = records.iter().flatten().map(|r| r.key.clone()).collect();
            BatchLoader::new(
                &self.store,
                &self.registry,
                &groups,
                self.config.max_batch_rounds,
            )
            .with_roots(keys)
            .resolve(pending)?;
        }
        for root in roots.iter_mut().flatten() {
            metadata.after_load(root);
        }
        Ok(roots)
    }
}

fn stored_discriminator(record: &Record, base: &str) -> String {
    match record.property(DISCRIMINATOR_PROPERTY).and_then(Node::as_value) {
        Some(Value::String(d)) => d.clone(),
        _ => base.to_string(),
    }
}

impl<S> std::fmt::Debug for Mapper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("kinds", &self.registry.kinds())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmap_store::InMemoryDatastore;
    use entmap_translate::{
        persist, Class, ClassBuilder, Field, HierarchyBuilder, Ref, Subclass, TranslateError,
        TranslateResult,
    };
    use entmap_types::RawKey;
    use std::collections::{BTreeMap, HashSet};

    // ---- fixtures ----

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Car {
        id: Option<i64>,
        plate: String,
        tags: Vec<String>,
        extras: BTreeMap<String, i64>,
    }

    impl Class for Car {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.id("id", |c| &c.id, |c| &mut c.id)?;
            class.field("plate", |c| &c.plate, |c| &mut c.plate)?;
            class.field("tags", |c| &c.tags, |c| &mut c.tags)?;
            class.field("extras", |c| &c.extras, |c| &mut c.extras)?;
            Ok(())
        }
    }

    persist!(entity Car);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Creature {
        id: Option<i64>,
        name: String,
    }

    impl Class for Creature {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.id("id", |c| &c.id, |c| &mut c.id)?;
            class.field("name", |c| &c.name, |c| &mut c.name)?;
            Ok(())
        }
    }

    persist!(embedded Creature);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Mammal {
        creature: Creature,
    }

    impl Class for Mammal {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.extends(|m| &m.creature, |m| &mut m.creature)?;
            Ok(())
        }
    }

    persist!(embedded Mammal);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Cat {
        mammal: Mammal,
    }

    impl Class for Cat {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.extends(|c| &c.mammal, |c| &mut c.mammal)?;
            Ok(())
        }
    }

    persist!(embedded Cat);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Dog {
        mammal: Mammal,
    }

    impl Class for Dog {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.extends(|d| &d.mammal, |d| &mut d.mammal)?;
            Ok(())
        }
    }

    persist!(embedded Dog);

    #[derive(Debug, Clone, PartialEq)]
    enum Animal {
        Plain(Creature),
        Mammal(Mammal),
        Cat(Cat),
        Dog(Dog),
    }

    impl Polymorphic for Animal {
        fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
            h.base(
                Animal::Plain,
                |a| match a {
                    Animal::Plain(c) => Some(c),
                    _ => None,
                },
                |a| match a {
                    Animal::Plain(c) => Some(c),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new().index(),
                Animal::Mammal,
                |a| match a {
                    Animal::Mammal(m) => Some(m),
                    _ => None,
                },
                |a| match a {
                    Animal::Mammal(m) => Some(m),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new().extends::<Mammal>().index(),
                Animal::Cat,
                |a| match a {
                    Animal::Cat(c) => Some(c),
                    _ => None,
                },
                |a| match a {
                    Animal::Cat(c) => Some(c),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new().extends::<Mammal>(),
                Animal::Dog,
                |a| match a {
                    Animal::Dog(d) => Some(d),
                    _ => None,
                },
                |a| match a {
                    Animal::Dog(d) => Some(d),
                    _ => None,
                },
            )?;
            Ok(())
        }
    }

    persist!(polymorphic entity Animal);

    fn creature(name: &str) -> Creature {
        Creature {
            id: None,
            name: name.to_string(),
        }
    }

    fn zoo(mapper: &Mapper<InMemoryDatastore>) -> Vec<Key<Animal>> {
        mapper.register::<Animal>().unwrap();
        let mut animals = vec![
            Animal::Plain(creature("amoeba")),
            Animal::Mammal(Mammal {
                creature: creature("whale"),
            }),
            Animal::Cat(Cat {
                mammal: Mammal {
                    creature: creature("tom"),
                },
            }),
            Animal::Dog(Dog {
                mammal: Mammal {
                    creature: creature("rex"),
                },
            }),
        ];
        mapper.save_all(&mut animals).unwrap()
    }

    fn names(animals: &[Animal]) -> HashSet<String> {
        animals
            .iter()
            .map(|a| match a {
                Animal::Plain(c) => c.name.clone(),
                Animal::Mammal(m) => m.creature.name.clone(),
                Animal::Cat(c) => c.mammal.creature.name.clone(),
                Animal::Dog(d) => d.mammal.creature.name.clone(),
            })
            .collect()
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Debug, Default)]
    struct Team {
        id: Option<String>,
        captain: Option<Ref<Player>>,
        coach: Option<Ref<Player>>,
        summary: String,
    }

    impl Class for Team {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.id("id", |t| &t.id, |t| &mut t.id)?;
            class.field_with("captain", |t| &t.captain, |t| &mut t.captain, Field::new().eager())?;
            class.field_with(
                "coach",
                |t| &t.coach,
                |t| &mut t.coach,
                Field::new().eager_in(["staff"]),
            )?;
            class.on_load(|t| {
                let name = |r: &Option<Ref<Player>>| {
                    r.as_ref()
                        .and_then(|r| r.get())
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| "?".to_string())
                };
                t.summary = format!("{}/{}", name(&t.captain), name(&t.coach));
            });
            Ok(())
        }
    }

    persist!(entity Team);

    #[derive(Debug, Default)]
    struct Player {
        id: Option<i64>,
        name: String,
    }

    impl Class for Player {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.id("id", |p| &p.id, |p| &mut p.id)?;
            class.field("name", |p| &p.name, |p| &mut p.name)?;
            Ok(())
        }
    }

    persist!(entity Player);

    fn team(mapper: &Mapper<InMemoryDatastore>) -> Key<Team> {
        mapper.register::<Team>().unwrap();
        let mut captain = Player {
            id: None,
            name: "ada".into(),
        };
        let mut coach = Player {
            id: None,
            name: "bob".into(),
        };
        let captain = mapper.save(&mut captain).unwrap();
        let coach = mapper.save(&mut coach).unwrap();
        let mut team = Team {
            id: Some("reds".into()),
            captain: Some(Ref::new(captain)),
            coach: Some(Ref::new(coach)),
            summary: String::new(),
        };
        mapper.save(&mut team).unwrap()
    }

    #[derive(Debug, Default)]
    struct Ticket {
        id: Option<i64>,
        stamped: bool,
        extras: BTreeMap<String, i64>,
    }

    impl Class for Ticket {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.id("id", |t| &t.id, |t| &mut t.id)?;
            class.field("stamped", |t| &t.stamped, |t| &mut t.stamped)?;
            class.field("extras", |t| &t.extras, |t| &mut t.extras)?;
            class.on_save(|t| t.stamped = true);
            Ok(())
        }
    }

    persist!(entity Ticket);

    // ---- tests ----

    #[test]
    fn save_assigns_generated_ids() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Car>().unwrap();

        let mut first = Car {
            plate: "AB-1".into(),
            ..Default::default()
        };
        let mut second = first.clone();
        assert!(!mapper.key_of(&first).unwrap().raw().is_complete());

        let k1 = mapper.save(&mut first).unwrap();
        let k2 = mapper.save(&mut second).unwrap();
        assert_eq!(first.id, k1.numeric_id());
        assert_eq!(second.id, k2.numeric_id());
        assert!(first.id.is_some());
        assert_ne!(first.id, second.id);
        assert_eq!(mapper.key_of(&first).unwrap(), k1);
    }

    #[test]
    fn round_trip_through_the_store() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Car>().unwrap();
        let mut car = Car {
            id: Some(7),
            plate: "XY-9".into(),
            tags: vec!["red".into()],
            extras: BTreeMap::from([("seats".to_string(), 5)]),
        };
        let key = mapper.save(&mut car).unwrap();

        let loaded = mapper.load(&key).unwrap().unwrap();
        assert_eq!(loaded, car);

        let record = mapper.store().get(key.raw()).unwrap().unwrap();
        assert!(record.property("id").is_none());
    }

    #[test]
    fn empty_collections_are_not_stored() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Car>().unwrap();
        let mut car = Car {
            id: Some(1),
            ..Default::default()
        };
        let key = mapper.save(&mut car).unwrap();
        let record = mapper.store().get(key.raw()).unwrap().unwrap();
        assert!(!record.has_property("tags"));
        assert!(!record.has_property("extras"));

        let loaded = mapper.load(&key).unwrap().unwrap();
        assert!(loaded.tags.is_empty());
        assert!(loaded.extras.is_empty());
    }

    #[test]
    fn dotted_map_key_writes_nothing() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Car>().unwrap();
        let mut car = Car {
            id: Some(1),
            extras: BTreeMap::from([("illegal.value".to_string(), 1)]),
            ..Default::default()
        };
        let err = mapper.save(&mut car).unwrap_err();
        match err {
            MapperError::Translate(TranslateError::DottedMapKey { path, key }) => {
                assert_eq!(path, "extras");
                assert_eq!(key, "illegal.value");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(mapper.store().is_empty());
    }

    #[test]
    fn failed_batch_writes_nothing_after_running_every_hook() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Ticket>().unwrap();
        let mut tickets = vec![
            Ticket::default(),
            Ticket {
                extras: BTreeMap::from([("row.seat".to_string(), 4)]),
                ..Default::default()
            },
            Ticket::default(),
        ];
        let err = mapper.save_all(&mut tickets).unwrap_err();
        assert!(matches!(
            err,
            MapperError::Translate(TranslateError::DottedMapKey { .. })
        ));
        assert!(mapper.store().is_empty());
        assert!(tickets.iter().all(|t| t.stamped && t.id.is_none()));

        tickets[1].extras.clear();
        let keys = mapper.save_all(&mut tickets).unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(mapper.store().len(), 3);
        assert!(tickets.iter().all(|t| t.id.is_some()));
    }

    #[test]
    fn unregistered_entity_is_rejected() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        let mut car = Car::default();
        let err = mapper.save(&mut car).unwrap_err();
        assert!(matches!(
            err,
            MapperError::Translate(TranslateError::NotRegistered { .. })
        ));
    }

    #[test]
    fn registration_is_idempotent() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        let first = mapper.register::<Car>().unwrap();
        let second = mapper.register::<Car>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn load_many_preserves_order_and_gaps() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Car>().unwrap();
        let mut a = Car {
            plate: "A".into(),
            ..Default::default()
        };
        let mut b = Car {
            plate: "B".into(),
            ..Default::default()
        };
        let ka = mapper.save(&mut a).unwrap();
        let kb = mapper.save(&mut b).unwrap();
        let gone = Key::from_raw(RawKey::with_id("Car", -1));

        let loaded = mapper.load_many(&[kb, gone, ka]).unwrap();
        let plates: Vec<Option<String>> =
            loaded.into_iter().map(|c| c.map(|c| c.plate)).collect();
        assert_eq!(plates, vec![Some("B".into()), None, Some("A".into())]);
    }

    #[test]
    fn delete_removes_the_record() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Car>().unwrap();
        let mut car = Car::default();
        let key = mapper.save(&mut car).unwrap();
        assert!(mapper.delete(&key).unwrap());
        assert!(!mapper.delete(&key).unwrap());
        assert!(mapper.load(&key).unwrap().is_none());
    }

    #[test]
    fn load_kind_returns_all() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        zoo(&mapper);
        let all = mapper.load_kind::<Animal>().unwrap();
        assert_eq!(names(&all), set(&["amoeba", "whale", "tom", "rex"]));
    }

    #[test]
    fn query_by_type_uses_indexed_ancestors() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        let keys = zoo(&mapper);

        let cat = mapper.store().get(keys[2].raw()).unwrap().unwrap();
        let closure: Vec<&Value> = cat
            .property(DISCRIMINATOR_INDEX_PROPERTY)
            .and_then(Node::as_list)
            .unwrap()
            .iter()
            .filter_map(Node::as_value)
            .collect();
        assert_eq!(
            closure,
            vec![&Value::String("Mammal".into()), &Value::String("Cat".into())]
        );

        let animals = mapper.load_subtype::<Animal, Creature>().unwrap();
        assert_eq!(animals.len(), 4);
        let mammals = mapper.load_subtype::<Animal, Mammal>().unwrap();
        assert_eq!(names(&mammals), set(&["whale", "tom", "rex"]));
        let cats = mapper.load_subtype::<Animal, Cat>().unwrap();
        assert_eq!(names(&cats), set(&["tom"]));
        let dogs = mapper.load_subtype::<Animal, Dog>().unwrap();
        assert_eq!(names(&dogs), set(&["rex"]));
    }

    #[test]
    fn load_variant_enforces_the_requested_subtype() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        let keys = zoo(&mapper);
        let cat = &keys[2];

        let loaded = mapper.load_variant::<Animal, Mammal>(cat).unwrap().unwrap();
        assert!(matches!(loaded, Animal::Cat(_)));
        assert!(mapper.load_variant::<Animal, Creature>(cat).unwrap().is_some());

        let err = mapper.load_variant::<Animal, Dog>(cat).unwrap_err();
        match err {
            MapperError::TypeMismatch { found, .. } => assert_eq!(found, "Cat"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            mapper.load_variant::<Animal, Car>(cat),
            Err(MapperError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn eager_references_follow_load_groups() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        let key = team(&mapper);

        let plain = mapper.load(&key).unwrap().unwrap();
        assert!(plain.captain.as_ref().unwrap().is_loaded());
        assert!(!plain.coach.as_ref().unwrap().is_loaded());
        assert_eq!(plain.summary, "ada/?");

        let staffed = mapper.load_with_groups(&key, &["staff"]).unwrap().unwrap();
        assert!(staffed.coach.as_ref().unwrap().is_loaded());
        assert_eq!(staffed.summary, "ada/bob");
    }

    #[test]
    fn default_groups_come_from_config() {
        let config = MapperConfig::default().with_groups(["staff"]);
        let mapper = Mapper::with_config(InMemoryDatastore::new(), config);
        let key = team(&mapper);
        let loaded = mapper.load(&key).unwrap().unwrap();
        assert_eq!(loaded.summary, "ada/bob");
    }

    #[test]
    fn null_string_id_is_a_save_error() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Team>().unwrap();
        let mut team = Team::default();
        let err = mapper.save(&mut team).unwrap_err();
        assert!(matches!(
            err,
            MapperError::Translate(TranslateError::NullStringId { .. })
        ));
    }

    #[test]
    fn debug_lists_registered_kinds() {
        let mapper = Mapper::new(InMemoryDatastore::new());
        mapper.register::<Team>().unwrap();
        let text = format!("{mapper:?}");
        assert!(text.contains("Team"));
        assert!(text.contains("Player"));
    }
}
