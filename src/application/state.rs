//! The application state store.
//!
//! Every builder command goes through [`Store`]. Each mutation runs against a
//! copy of the current [`Workspace`] and only replaces it when the whole
//! operation succeeded, so a failed command never leaves partial changes
//! behind. Committed changes are written through to a [`SnapshotSink`],
//! recorded for undo, and broadcast to subscribers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use super::session::Session;
use crate::domain::{
    App, AppId, Binding, BindingResolver, Component, ComponentId, ComponentType,
    DEFAULT_APP_NAME, DEFAULT_PAGE_NAME, DEFAULT_PAGE_PATH, DomainError, DomainResult, Field,
    FieldType, Page, PageId, ParentRef, PropValue, Record, RecordExporter, RecordId,
    RenderContext, RenderedProp, Table, TableId, Workspace,
};

/// Default bound on the undo history.
pub const DEFAULT_UNDO_LIMIT: usize = 100;

/// Durable home of workspace snapshots.
///
/// The store never touches storage itself; it hydrates once when opened and
/// hands every committed snapshot to `flush`.
pub trait SnapshotSink {
    /// Loads the persisted workspace, seeding a fresh one when nothing exists yet.
    fn hydrate(&mut self) -> DomainResult<Workspace>;

    /// Persists `snapshot`. Snapshots not newer than the last one written are ignored.
    fn flush(&mut self, snapshot: &Workspace) -> DomainResult<()>;

    /// An error from a deferred flush, if one happened since the last call.
    fn take_error(&mut self) -> Option<DomainError> {
        None
    }
}

/// What a committed mutation changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    AppCreated(AppId),
    AppRenamed(AppId),
    AppDeleted(AppId),
    PageCreated(PageId),
    PageRenamed(PageId),
    PageDeleted(PageId),
    ComponentAdded(ComponentId),
    ComponentMoved(ComponentId),
    ComponentDuplicated { source: ComponentId, copy: ComponentId },
    ComponentDeleted(ComponentId),
    PropChanged { component: ComponentId, prop: String },
    LibraryUpdated(AppId),
    TableCreated(TableId),
    TableRenamed(TableId),
    TableDeleted(TableId),
    FieldAdded { table: TableId, field: String },
    FieldRemoved { table: TableId, field: String },
    RecordAdded { table: TableId, record: RecordId },
    RecordUpdated { table: TableId, record: RecordId },
    RecordDeleted { table: TableId, record: RecordId },
    RecordsImported { table: TableId, count: usize },
    Undone,
    Redone,
}

/// Notifications sent to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Changed { version: u64, change: Change },
    /// The change is live in memory but may be lost on reload.
    PersistenceWarning { message: String },
}

/// Single source of truth for one workspace.
///
/// # Examples
///
/// ```
/// use pagecraft::application::{MemorySink, Store};
/// use pagecraft::domain::{ComponentType, ParentRef};
///
/// let mut store = Store::open(MemorySink::default(), 100).unwrap();
/// let session = store.default_session().unwrap();
///
/// let page = ParentRef::Page(session.current_page.clone());
/// let text = store.add_component(&session, &page, ComponentType::Text, None).unwrap();
/// assert_eq!(store.page(&session.current_page).unwrap().components, vec![text.id]);
/// ```
pub struct Store<P: SnapshotSink> {
    workspace: Workspace,
    persistence: P,
    undo_stack: VecDeque<Workspace>,
    redo_stack: VecDeque<Workspace>,
    undo_limit: usize,
    subscribers: Vec<Sender<StoreEvent>>,
    warnings: Vec<DomainError>,
}

impl<P: SnapshotSink> Store<P> {
    /// Hydrates the workspace from `persistence`.
    ///
    /// A seed workspace that could not be written still opens; the failure
    /// is queued in [`Store::take_warnings`].
    pub fn open(mut persistence: P, undo_limit: usize) -> DomainResult<Self> {
        let workspace = persistence.hydrate()?;
        workspace.check_integrity()?;
        debug!(version = workspace.version, apps = workspace.apps.len(), "workspace hydrated");

        let mut warnings = Vec::new();
        if let Some(err) = persistence.take_error() {
            warn!(error = %err, "workspace not persisted; changes are held in memory only");
            warnings.push(err);
        }

        Ok(Self {
            workspace,
            persistence,
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            undo_limit,
            subscribers: Vec::new(),
            warnings,
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> &Workspace {
        &self.workspace
    }

    pub fn version(&self) -> u64 {
        self.workspace.version
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    /// Receives a [`StoreEvent`] for every later mutation.
    pub fn subscribe(&mut self) -> Receiver<StoreEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.push(sender);
        receiver
    }

    /// Persistence failures collected since the last call.
    pub fn take_warnings(&mut self) -> Vec<DomainError> {
        std::mem::take(&mut self.warnings)
    }

    /// A session opened on the first app and its default page.
    pub fn default_session(&self) -> DomainResult<Session> {
        let app_id = self
            .workspace
            .app_order
            .first()
            .ok_or_else(|| DomainError::NotFound("workspace has no apps".to_string()))?;
        let app = self.workspace.app(app_id)?;
        let page = default_page(app)?;
        Ok(Session::new(app_id.clone(), page))
    }

    /// Points `session` back at live entities after another session or an
    /// undo removed what it referenced.
    pub fn repair_session(&self, session: &mut Session) -> DomainResult<()> {
        if !self.workspace.apps.contains_key(&session.current_app) {
            *session = self.default_session()?;
            return Ok(());
        }
        let page_is_live = self
            .workspace
            .pages
            .get(&session.current_page)
            .is_some_and(|page| page.app_id == session.current_app);
        if !page_is_live {
            session.current_page = default_page(self.workspace.app(&session.current_app)?)?;
        }
        if let Some(selected) = session.selected() {
            if self.in_current_app(session, selected).is_err() {
                session.clear_selection();
            }
        }
        Ok(())
    }

    // Reads

    pub fn apps(&self) -> impl Iterator<Item = &App> {
        self.workspace
            .app_order
            .iter()
            .filter_map(|id| self.workspace.apps.get(id))
    }

    pub fn app(&self, id: &AppId) -> DomainResult<&App> {
        self.workspace.app(id)
    }

    pub fn page(&self, id: &PageId) -> DomainResult<&Page> {
        self.workspace.page(id)
    }

    pub fn component(&self, id: &ComponentId) -> DomainResult<&Component> {
        self.workspace.component(id)
    }

    pub fn table(&self, id: &TableId) -> DomainResult<&Table> {
        self.workspace.table(id)
    }

    pub fn current_app(&self, session: &Session) -> DomainResult<&App> {
        self.workspace.app(&session.current_app)
    }

    pub fn current_page(&self, session: &Session) -> DomainResult<&Page> {
        self.workspace.page(&session.current_page)
    }

    // Apps

    /// Creates an app with a "Home" page at `/` and makes it current.
    pub fn create_app(
        &mut self,
        session: &mut Session,
        name: &str,
        description: Option<&str>,
    ) -> DomainResult<App> {
        let name = required_name("app", name)?;
        let description = description.map(str::trim).filter(|d| !d.is_empty());

        let app = self.apply(|ws| {
            let app_id = AppId::new(ws.allocate_id(AppId::PREFIX));
            let page_id = PageId::new(ws.allocate_id(PageId::PREFIX));
            ws.pages.insert(
                page_id.clone(),
                Page {
                    id: page_id.clone(),
                    app_id: app_id.clone(),
                    name: DEFAULT_PAGE_NAME.to_string(),
                    path: DEFAULT_PAGE_PATH.to_string(),
                    components: Vec::new(),
                },
            );
            let app = App {
                id: app_id.clone(),
                name: name.to_string(),
                description: description.map(str::to_string),
                pages: vec![page_id],
                components: Vec::new(),
                tables: Vec::new(),
            };
            ws.apps.insert(app_id.clone(), app.clone());
            ws.app_order.push(app_id.clone());
            Ok((app, Change::AppCreated(app_id)))
        })?;

        session.current_app = app.id.clone();
        session.current_page = default_page(&app)?;
        session.clear_selection();
        Ok(app)
    }

    /// Makes `app_id` current and resets the page to the app's default page.
    pub fn select_app(&self, session: &mut Session, app_id: &AppId) -> DomainResult<()> {
        let app = self.workspace.app(app_id)?;
        session.current_page = default_page(app)?;
        session.current_app = app_id.clone();
        session.clear_selection();
        Ok(())
    }

    pub fn rename_app(&mut self, app_id: &AppId, name: &str) -> DomainResult<()> {
        let name = required_name("app", name)?;
        self.apply(|ws| {
            ws.app_mut(app_id)?.name = name.to_string();
            Ok(((), Change::AppRenamed(app_id.clone())))
        })
    }

    /// Deletes an app with its pages, library and tables. The last app cannot be deleted.
    pub fn delete_app(&mut self, session: &mut Session, app_id: &AppId) -> DomainResult<()> {
        self.apply(|ws| {
            ws.app(app_id)?;
            if ws.apps.len() == 1 {
                return Err(DomainError::validation("cannot delete the only app in the workspace"));
            }
            ws.remove_app(app_id)?;
            Ok(((), Change::AppDeleted(app_id.clone())))
        })?;
        self.repair_session(session)
    }

    // Pages

    pub fn create_page(&mut self, app_id: &AppId, name: &str, path: &str) -> DomainResult<Page> {
        let name = required_name("page", name)?;
        let path = path.trim();
        if !path.starts_with('/') {
            return Err(DomainError::validation(format!("page path '{path}' must start with '/'")));
        }

        self.apply(|ws| {
            ws.app(app_id)?;
            if ws.page_by_path(app_id, path).is_some() {
                return Err(DomainError::validation(format!(
                    "path '{path}' is already used in app '{app_id}'"
                )));
            }
            let page = Page {
                id: PageId::new(ws.allocate_id(PageId::PREFIX)),
                app_id: app_id.clone(),
                name: name.to_string(),
                path: path.to_string(),
                components: Vec::new(),
            };
            ws.app_mut(app_id)?.pages.push(page.id.clone());
            ws.pages.insert(page.id.clone(), page.clone());
            Ok((page.clone(), Change::PageCreated(page.id)))
        })
    }

    /// Makes a page of the current app current.
    pub fn select_page(&self, session: &mut Session, page_id: &PageId) -> DomainResult<()> {
        let page = self.workspace.page(page_id)?;
        if page.app_id != session.current_app {
            return Err(DomainError::not_found(
                "page",
                format!("{page_id} in app {}", session.current_app),
            ));
        }
        session.current_page = page_id.clone();
        session.clear_selection();
        Ok(())
    }

    pub fn rename_page(&mut self, page_id: &PageId, name: &str) -> DomainResult<()> {
        let name = required_name("page", name)?;
        self.apply(|ws| {
            ws.page_mut(page_id)?.name = name.to_string();
            Ok(((), Change::PageRenamed(page_id.clone())))
        })
    }

    /// Deletes a page and its components. An app always keeps at least one page.
    pub fn delete_page(&mut self, session: &mut Session, page_id: &PageId) -> DomainResult<()> {
        self.apply(|ws| {
            let app_id = ws.page(page_id)?.app_id.clone();
            if ws.app(&app_id)?.pages.len() == 1 {
                return Err(DomainError::validation(format!(
                    "cannot delete the last page of app '{app_id}'"
                )));
            }
            ws.remove_page(page_id)?;
            Ok(((), Change::PageDeleted(page_id.clone())))
        })?;
        self.repair_session(session)
    }

    // Components

    /// Drops a new component under `parent` at `index` (default: last).
    pub fn add_component(
        &mut self,
        session: &Session,
        parent: &ParentRef,
        component_type: ComponentType,
        index: Option<usize>,
    ) -> DomainResult<Component> {
        self.apply(|ws| {
            ensure_parent_in_app(ws, parent, &session.current_app)?;
            ws.check_parent(parent)?;

            let id = ComponentId::new(ws.allocate_id(ComponentId::PREFIX));
            let component = Component::new(id.clone(), component_type, parent.clone());
            ws.components.insert(id.clone(), component.clone());
            ws.attach(&id, parent, index)?;
            Ok((component, Change::ComponentAdded(id)))
        })
    }

    /// Reparents a component. `index` addresses the new parent's children
    /// after the component has been taken out of its old position.
    pub fn move_component(
        &mut self,
        session: &Session,
        component_id: &ComponentId,
        new_parent: &ParentRef,
        index: usize,
    ) -> DomainResult<()> {
        self.apply(|ws| {
            ensure_component_in_app(ws, component_id, &session.current_app)?;
            if let ParentRef::Component(target) = new_parent {
                if ws.is_descendant(target, component_id) {
                    return Err(DomainError::Cycle(format!(
                        "cannot move '{component_id}' into itself or its descendant '{target}'"
                    )));
                }
            }
            ensure_parent_in_app(ws, new_parent, &session.current_app)?;
            ws.check_parent(new_parent)?;

            ws.detach(component_id)?;
            ws.attach(component_id, new_parent, Some(index))?;
            Ok(((), Change::ComponentMoved(component_id.clone())))
        })
    }

    /// Deep-copies a component subtree and inserts it right after the original.
    pub fn duplicate_component(
        &mut self,
        session: &Session,
        component_id: &ComponentId,
    ) -> DomainResult<Component> {
        self.apply(|ws| {
            ensure_component_in_app(ws, component_id, &session.current_app)?;
            let parent = ws.component(component_id)?.parent.clone();
            let position = ws
                .children(&parent)?
                .iter()
                .position(|id| id == component_id)
                .map(|p| p + 1);
            let copy = ws.clone_subtree(component_id, &parent, position)?;
            let component = ws.component(&copy)?.clone();
            Ok((
                component,
                Change::ComponentDuplicated { source: component_id.clone(), copy },
            ))
        })
    }

    /// Removes a component and its subtree. Deleting a missing component is a no-op.
    pub fn delete_component(
        &mut self,
        session: &mut Session,
        component_id: &ComponentId,
    ) -> DomainResult<()> {
        if !self.workspace.components.contains_key(component_id) {
            return Ok(());
        }
        let removed = self.apply(|ws| {
            ensure_component_in_app(ws, component_id, &session.current_app)?;
            let removed = ws.remove_subtree(component_id)?;
            Ok((removed, Change::ComponentDeleted(component_id.clone())))
        })?;
        session.forget_components(&removed);
        Ok(())
    }

    /// Copies a component subtree into the current app's component library.
    pub fn save_to_library(
        &mut self,
        session: &Session,
        component_id: &ComponentId,
    ) -> DomainResult<Component> {
        self.apply(|ws| {
            ensure_component_in_app(ws, component_id, &session.current_app)?;
            let library = ParentRef::Library(session.current_app.clone());
            let copy = ws.clone_subtree(component_id, &library, None)?;
            let component = ws.component(&copy)?.clone();
            Ok((component, Change::LibraryUpdated(session.current_app.clone())))
        })
    }

    /// Places a copy of a library definition under `parent`.
    pub fn instantiate_from_library(
        &mut self,
        session: &Session,
        library_id: &ComponentId,
        parent: &ParentRef,
        index: Option<usize>,
    ) -> DomainResult<Component> {
        self.apply(|ws| {
            let library = ParentRef::Library(session.current_app.clone());
            if ws.component(library_id)?.parent != library {
                return Err(DomainError::not_found(
                    "library component",
                    format!("{library_id} in app {}", session.current_app),
                ));
            }
            ensure_parent_in_app(ws, parent, &session.current_app)?;
            ws.check_parent(parent)?;
            let copy = ws.clone_subtree(library_id, parent, index)?;
            let component = ws.component(&copy)?.clone();
            Ok((component, Change::ComponentAdded(copy)))
        })
    }

    /// Selects a component of the current app.
    pub fn select_component(
        &self,
        session: &mut Session,
        component_id: &ComponentId,
    ) -> DomainResult<()> {
        self.in_current_app(session, component_id)?;
        session.select(component_id.clone())
    }

    /// Sets a prop on the component being edited.
    pub fn set_prop(
        &mut self,
        session: &Session,
        component_id: &ComponentId,
        name: &str,
        value: PropValue,
    ) -> DomainResult<()> {
        if session.editing() != Some(component_id) {
            return Err(DomainError::validation(format!(
                "component '{component_id}' is not being edited"
            )));
        }
        let name = required_name("prop", name)?;
        self.apply(|ws| {
            ensure_component_in_app(ws, component_id, &session.current_app)?;
            ws.component_mut(component_id)?.props.insert(name.to_string(), value);
            Ok((
                (),
                Change::PropChanged { component: component_id.clone(), prop: name.to_string() },
            ))
        })
    }

    /// Sets a prop from property-panel text; `{{ }}` markers make it a binding.
    pub fn set_prop_text(
        &mut self,
        session: &Session,
        component_id: &ComponentId,
        name: &str,
        input: &str,
    ) -> DomainResult<()> {
        let value = PropValue::from_input(input)?;
        self.set_prop(session, component_id, name, value)
    }

    // Tables

    pub fn create_table(&mut self, app_id: &AppId, name: &str) -> DomainResult<Table> {
        let name = required_name("table", name)?;
        self.apply(|ws| {
            ws.app(app_id)?;
            if ws.table_by_name(app_id, name).is_some() {
                return Err(DomainError::validation(format!(
                    "table '{name}' already exists in app '{app_id}'"
                )));
            }
            let table = Table {
                id: TableId::new(ws.allocate_id(TableId::PREFIX)),
                app_id: app_id.clone(),
                name: name.to_string(),
                fields: Vec::new(),
                records: Vec::new(),
            };
            ws.app_mut(app_id)?.tables.push(table.id.clone());
            ws.tables.insert(table.id.clone(), table.clone());
            Ok((table.clone(), Change::TableCreated(table.id)))
        })
    }

    pub fn rename_table(&mut self, table_id: &TableId, name: &str) -> DomainResult<()> {
        let name = required_name("table", name)?;
        self.apply(|ws| {
            let app_id = ws.table(table_id)?.app_id.clone();
            if ws
                .table_by_name(&app_id, name)
                .is_some_and(|other| &other.id != table_id)
            {
                return Err(DomainError::validation(format!(
                    "table '{name}' already exists in app '{app_id}'"
                )));
            }
            ws.table_mut(table_id)?.name = name.to_string();
            Ok(((), Change::TableRenamed(table_id.clone())))
        })
    }

    pub fn delete_table(&mut self, table_id: &TableId) -> DomainResult<()> {
        self.apply(|ws| {
            ws.remove_table(table_id)?;
            Ok(((), Change::TableDeleted(table_id.clone())))
        })
    }

    /// Adds a field. Existing records receive the field's empty value, or a
    /// fresh identifier for UUID fields.
    pub fn add_field(
        &mut self,
        table_id: &TableId,
        name: &str,
        field_type: FieldType,
    ) -> DomainResult<Field> {
        let name = required_name("field", name)?;
        self.apply(|ws| {
            let table = ws.table_mut(table_id)?;
            if table.field(name).is_some() {
                return Err(DomainError::validation(format!(
                    "field '{name}' already exists in table '{}'",
                    table.name
                )));
            }
            let field = Field { name: name.to_string(), field_type };
            for record in &mut table.records {
                let value = if field_type.generates_values() {
                    Value::from(uuid::Uuid::new_v4().to_string())
                } else {
                    field_type.empty_value()
                };
                record.values.insert(field.name.clone(), value);
            }
            table.fields.push(field.clone());
            Ok((
                field,
                Change::FieldAdded { table: table_id.clone(), field: name.to_string() },
            ))
        })
    }

    /// Removes a field and strips its values from every record. Removing an
    /// absent field is a no-op.
    pub fn remove_field(&mut self, table_id: &TableId, name: &str) -> DomainResult<()> {
        let name = name.trim();
        if self.workspace.table(table_id)?.field(name).is_none() {
            return Ok(());
        }
        self.apply(|ws| {
            let table = ws.table_mut(table_id)?;
            table.fields.retain(|field| field.name != name);
            for record in &mut table.records {
                record.values.remove(name);
            }
            Ok((
                (),
                Change::FieldRemoved { table: table_id.clone(), field: name.to_string() },
            ))
        })
    }

    /// Adds a record. Missing UUID fields are generated; any other missing
    /// field stores its explicit empty value and is never made up.
    pub fn add_record(
        &mut self,
        table_id: &TableId,
        values: BTreeMap<String, Value>,
    ) -> DomainResult<Record> {
        self.apply(|ws| {
            let table = ws.table_mut(table_id)?;
            let record = Record {
                id: RecordId::generate(),
                values: table.build_values(values)?,
                created_at: Utc::now(),
            };
            table.records.push(record.clone());
            Ok((
                record.clone(),
                Change::RecordAdded { table: table_id.clone(), record: record.id },
            ))
        })
    }

    /// Overwrites the given fields of a record.
    pub fn update_record(
        &mut self,
        table_id: &TableId,
        record_id: &RecordId,
        values: BTreeMap<String, Value>,
    ) -> DomainResult<Record> {
        self.apply(|ws| {
            let table = ws.table_mut(table_id)?;
            table.check_values(&values)?;
            let record = table
                .records
                .iter_mut()
                .find(|record| &record.id == record_id)
                .ok_or_else(|| DomainError::not_found("record", record_id))?;
            record.values.extend(values);
            Ok((
                record.clone(),
                Change::RecordUpdated { table: table_id.clone(), record: record_id.clone() },
            ))
        })
    }

    /// Removes a record. Deleting a missing record is a no-op.
    pub fn delete_record(&mut self, table_id: &TableId, record_id: &RecordId) -> DomainResult<()> {
        if self.workspace.table(table_id)?.record(record_id).is_none() {
            return Ok(());
        }
        self.apply(|ws| {
            ws.table_mut(table_id)?.records.retain(|record| &record.id != record_id);
            Ok((
                (),
                Change::RecordDeleted { table: table_id.clone(), record: record_id.clone() },
            ))
        })
    }

    /// Adds one record per CSV row. Either every row is imported or none is.
    pub fn import_records_csv(
        &mut self,
        table_id: &TableId,
        data: &str,
    ) -> DomainResult<Vec<Record>> {
        let rows = RecordExporter::import_csv(self.workspace.table(table_id)?, data)?;
        self.apply(|ws| {
            let table = ws.table_mut(table_id)?;
            let mut imported = Vec::with_capacity(rows.len());
            for values in rows {
                let record = Record {
                    id: RecordId::generate(),
                    values: table.build_values(values)?,
                    created_at: Utc::now(),
                };
                table.records.push(record.clone());
                imported.push(record);
            }
            let count = imported.len();
            Ok((imported, Change::RecordsImported { table: table_id.clone(), count }))
        })
    }

    pub fn export_records_csv(&self, table_id: &TableId) -> DomainResult<String> {
        RecordExporter::export_csv(self.workspace.table(table_id)?)
    }

    /// Stores form input as a record of the table named by the form's `table` prop.
    pub fn submit_form(
        &mut self,
        session: &Session,
        form_id: &ComponentId,
        values: BTreeMap<String, Value>,
    ) -> DomainResult<Record> {
        self.in_current_app(session, form_id)?;
        let form = self.workspace.component(form_id)?;
        if form.component_type != ComponentType::Form {
            return Err(DomainError::validation(format!(
                "component '{form_id}' is a {}, not a form",
                form.component_type
            )));
        }
        let table_name = match form.props.get("table") {
            Some(PropValue::Static(Value::String(name))) if !name.is_empty() => name.clone(),
            _ => {
                return Err(DomainError::validation(format!(
                    "form '{form_id}' is not connected to a table"
                )));
            }
        };
        let table_id = self
            .workspace
            .table_by_name(&session.current_app, &table_name)
            .map(|table| table.id.clone())
            .ok_or_else(|| DomainError::not_found("table", &table_name))?;
        self.add_record(&table_id, values)
    }

    // Bindings

    /// Resolves a binding against the current app.
    pub fn resolve_binding(
        &self,
        session: &Session,
        binding: &Binding,
        context: &RenderContext,
    ) -> DomainResult<Value> {
        BindingResolver::new(&self.workspace, &session.current_app).resolve(binding, context)
    }

    /// Resolves every prop of a component. Failing bindings render as `null`
    /// with a warning instead of failing the whole component.
    pub fn render_props(
        &self,
        session: &Session,
        component_id: &ComponentId,
        context: &RenderContext,
    ) -> DomainResult<BTreeMap<String, RenderedProp>> {
        self.in_current_app(session, component_id)?;
        let resolver = BindingResolver::new(&self.workspace, &session.current_app);
        Ok(self
            .workspace
            .component(component_id)?
            .props
            .iter()
            .map(|(name, prop)| (name.clone(), resolver.render(prop, context)))
            .collect())
    }

    /// One render context per item of a repeater's `source`.
    pub fn repeater_contexts(
        &self,
        session: &Session,
        repeater_id: &ComponentId,
    ) -> DomainResult<Vec<RenderContext>> {
        self.in_current_app(session, repeater_id)?;
        let repeater = self.workspace.component(repeater_id)?;
        if repeater.component_type != ComponentType::Repeater {
            return Err(DomainError::validation(format!(
                "component '{repeater_id}' is not a repeater"
            )));
        }
        let source = match repeater.props.get("source") {
            Some(PropValue::Bound(binding)) => {
                self.resolve_binding(session, binding, &RenderContext::default())?
            }
            Some(PropValue::Static(value)) => value.clone(),
            None => Value::Null,
        };
        match source {
            Value::Array(items) => Ok(items.into_iter().map(RenderContext::with_item).collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(DomainError::binding(format!("repeater source is not a list: {other}"))),
        }
    }

    // History

    /// Restores the snapshot before the last mutation. Returns false when
    /// there is nothing to undo.
    pub fn undo(&mut self, session: &mut Session) -> DomainResult<bool> {
        let Some(previous) = self.undo_stack.pop_back() else {
            return Ok(false);
        };
        let current = self.restore(previous);
        self.redo_stack.push_back(current);
        self.commit(Change::Undone);
        self.repair_session(session)?;
        Ok(true)
    }

    pub fn redo(&mut self, session: &mut Session) -> DomainResult<bool> {
        let Some(next) = self.redo_stack.pop_back() else {
            return Ok(false);
        };
        let current = self.restore(next);
        self.push_undo(current);
        self.commit(Change::Redone);
        self.repair_session(session)?;
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    fn restore(&mut self, mut snapshot: Workspace) -> Workspace {
        snapshot.version = self.workspace.version + 1;
        snapshot.next_seq = snapshot.next_seq.max(self.workspace.next_seq);
        std::mem::replace(&mut self.workspace, snapshot)
    }

    fn push_undo(&mut self, snapshot: Workspace) {
        self.undo_stack.push_back(snapshot);
        if self.undo_stack.len() > self.undo_limit {
            self.undo_stack.pop_front();
        }
    }

    /// Runs `mutate` on a copy of the workspace and commits the copy only if it succeeds.
    fn apply<T>(
        &mut self,
        mutate: impl FnOnce(&mut Workspace) -> DomainResult<(T, Change)>,
    ) -> DomainResult<T> {
        let mut next = self.workspace.clone();
        let (output, change) = mutate(&mut next)?;
        next.version = self.workspace.version + 1;

        let previous = std::mem::replace(&mut self.workspace, next);
        self.push_undo(previous);
        self.redo_stack.clear();
        self.commit(change);
        Ok(output)
    }

    fn commit(&mut self, change: Change) {
        let version = self.workspace.version;
        debug!(version, ?change, "workspace mutated");

        if let Err(err) = self.persistence.flush(&self.workspace) {
            self.report_persistence_failure(err);
        }
        if let Some(err) = self.persistence.take_error() {
            self.report_persistence_failure(err);
        }
        self.broadcast(StoreEvent::Changed { version, change });
    }

    fn report_persistence_failure(&mut self, err: DomainError) {
        warn!(error = %err, "flush failed; workspace changes are held in memory only");
        self.broadcast(StoreEvent::PersistenceWarning { message: err.to_string() });
        self.warnings.push(err);
    }

    fn broadcast(&mut self, event: StoreEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn in_current_app(&self, session: &Session, component_id: &ComponentId) -> DomainResult<()> {
        ensure_component_in_app(&self.workspace, component_id, &session.current_app)
    }
}

/// A sink that keeps nothing: hydrates the default seed and discards flushes.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub flushed_versions: Vec<u64>,
}

impl SnapshotSink for MemorySink {
    fn hydrate(&mut self) -> DomainResult<Workspace> {
        Ok(Workspace::seeded(DEFAULT_APP_NAME))
    }

    fn flush(&mut self, snapshot: &Workspace) -> DomainResult<()> {
        self.flushed_versions.push(snapshot.version);
        Ok(())
    }
}

fn required_name<'n>(what: &str, name: &'n str) -> DomainResult<&'n str> {
    let name = name.trim();
    if name.is_empty() {
        Err(DomainError::validation(format!("{what} name must not be empty")))
    } else {
        Ok(name)
    }
}

fn default_page(app: &App) -> DomainResult<PageId> {
    app.default_page()
        .cloned()
        .ok_or_else(|| DomainError::NotFound(format!("app '{}' has no pages", app.id)))
}

fn ensure_parent_in_app(ws: &Workspace, parent: &ParentRef, app_id: &AppId) -> DomainResult<()> {
    match ws.app_of_parent(parent) {
        Ok(owner) if &owner == app_id => Ok(()),
        _ => Err(DomainError::not_found("parent", format!("{parent} in app {app_id}"))),
    }
}

fn ensure_component_in_app(
    ws: &Workspace,
    component_id: &ComponentId,
    app_id: &AppId,
) -> DomainResult<()> {
    match ws.app_of_component(component_id) {
        Ok(owner) if &owner == app_id => Ok(()),
        _ => Err(DomainError::not_found("component", format!("{component_id} in app {app_id}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Selection;
    use crate::infrastructure::{MemoryKeyValueStore, PersistenceAdapter};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn store() -> (Store<MemorySink>, Session) {
        let store = Store::open(MemorySink::default(), DEFAULT_UNDO_LIMIT).unwrap();
        let session = store.default_session().unwrap();
        (store, session)
    }

    fn page_root(session: &Session) -> ParentRef {
        ParentRef::Page(session.current_page.clone())
    }

    fn add(
        store: &mut Store<MemorySink>,
        session: &Session,
        parent: &ParentRef,
        t: ComponentType,
    ) -> ComponentId {
        store.add_component(session, parent, t, None).unwrap().id
    }

    /// Shape of a subtree: type, props and children, ignoring ids.
    fn shape(ws: &Workspace, id: &ComponentId) -> Value {
        let component = &ws.components[id];
        json!({
            "type": component.component_type.as_str(),
            "props": serde_json::to_value(&component.props).unwrap(),
            "children": component.children.iter().map(|c| shape(ws, c)).collect::<Vec<_>>(),
        })
    }

    #[test]
    fn test_default_session_points_at_seed() {
        let (store, session) = store();
        assert_eq!(session.current_app, AppId::from("app-1"));
        assert_eq!(session.current_page, PageId::from("page-1"));
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_create_app_sets_current_and_home_page() {
        let (mut store, mut session) = store();
        let app = store.create_app(&mut session, "  Shop  ", Some("storefront")).unwrap();

        assert_eq!(app.name, "Shop");
        assert_eq!(app.description.as_deref(), Some("storefront"));
        assert_eq!(session.current_app, app.id);
        let home = store.current_page(&session).unwrap();
        assert_eq!((home.name.as_str(), home.path.as_str()), ("Home", "/"));
        assert_eq!(store.apps().count(), 2);
    }

    #[test]
    fn test_create_app_rejects_empty_name() {
        let (mut store, mut session) = store();
        let before = store.snapshot().clone();
        let err = store.create_app(&mut session, "   ", None).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(store.snapshot(), &before);
    }

    #[test]
    fn test_select_app_resets_page() {
        let (mut store, mut session) = store();
        let app_id = session.current_app.clone();
        let about = store.create_page(&app_id, "About", "/about").unwrap();
        store.select_page(&mut session, &about.id).unwrap();

        store.create_app(&mut session, "Other", None).unwrap();
        store.select_app(&mut session, &app_id).unwrap();
        assert_eq!(session.current_page, PageId::from("page-1"));

        let err = store.select_app(&mut session, &AppId::from("app-404")).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn test_duplicate_path_is_rejected() {
        let (mut store, session) = store();
        let app_id = session.current_app.clone();
        store.create_page(&app_id, "About", "/about").unwrap();
        let pages_before = store.app(&app_id).unwrap().pages.clone();

        let err = store.create_page(&app_id, "About again", "/about").unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(matches!(store.create_page(&app_id, "Root", "/"), Err(DomainError::Validation(_))));
        assert!(matches!(
            store.create_page(&app_id, "Bad", "about"),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(store.app(&app_id).unwrap().pages, pages_before);
    }

    #[test]
    fn test_same_path_allowed_in_different_apps() {
        let (mut store, mut session) = store();
        store.create_page(&AppId::from("app-1"), "About", "/about").unwrap();
        let other = store.create_app(&mut session, "Other", None).unwrap();
        store.create_page(&other.id, "About", "/about").unwrap();
        store.snapshot().check_integrity().unwrap();
    }

    #[test]
    fn test_renames() {
        let (mut store, session) = store();
        let app_id = session.current_app.clone();
        store.rename_app(&app_id, "CRM").unwrap();
        store.rename_page(&session.current_page, "Start").unwrap();
        let users = store.create_table(&app_id, "Users").unwrap();
        let orders = store.create_table(&app_id, "Orders").unwrap();

        store.rename_table(&users.id, " Customers ").unwrap();
        store.rename_table(&users.id, "Customers").unwrap();
        assert!(matches!(
            store.rename_table(&orders.id, "Customers"),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            store.rename_page(&session.current_page, ""),
            Err(DomainError::Validation(_))
        ));

        assert_eq!(store.app(&app_id).unwrap().name, "CRM");
        assert_eq!(store.current_page(&session).unwrap().name, "Start");
        assert_eq!(store.table(&users.id).unwrap().name, "Customers");
    }

    #[test]
    fn test_add_component_inserts_at_index_with_defaults() {
        let (mut store, session) = store();
        let root = page_root(&session);
        let first = add(&mut store, &session, &root, ComponentType::Text);
        let button = store
            .add_component(&session, &root, ComponentType::Button, Some(0))
            .unwrap();

        assert_eq!(button.props["label"], PropValue::Static(json!("Button")));
        assert_eq!(store.current_page(&session).unwrap().components, vec![button.id, first]);
    }

    #[test]
    fn test_add_component_unknown_parent() {
        let (mut store, session) = store();
        let missing = ParentRef::Component(ComponentId::from("comp-404"));
        let err = store
            .add_component(&session, &missing, ComponentType::Text, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn test_add_component_outside_current_app() {
        let (mut store, mut session) = store();
        let original_page = page_root(&session);
        store.create_app(&mut session, "Other", None).unwrap();
        let err = store
            .add_component(&session, &original_page, ComponentType::Text, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn test_add_component_into_leaf_is_rejected() {
        let (mut store, session) = store();
        let text = add(&mut store, &session, &page_root(&session), ComponentType::Text);
        let err = store
            .add_component(&session, &ParentRef::Component(text), ComponentType::Text, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn test_move_into_self_or_descendant_is_a_cycle() {
        let (mut store, session) = store();
        let outer = add(&mut store, &session, &page_root(&session), ComponentType::Container);
        let inner = add(
            &mut store,
            &session,
            &ParentRef::Component(outer.clone()),
            ComponentType::Container,
        );
        let before = store.snapshot().clone();

        let err = store
            .move_component(&session, &outer, &ParentRef::Component(outer.clone()), 0)
            .unwrap_err();
        assert!(matches!(err, DomainError::Cycle(_)));

        let err = store
            .move_component(&session, &outer, &ParentRef::Component(inner.clone()), 0)
            .unwrap_err();
        assert!(matches!(err, DomainError::Cycle(_)));
        assert_eq!(store.snapshot(), &before);
    }

    #[test]
    fn test_move_component_reparents() {
        let (mut store, session) = store();
        let root = page_root(&session);
        let form = add(&mut store, &session, &root, ComponentType::Form);
        let input = add(&mut store, &session, &root, ComponentType::Input);

        store
            .move_component(&session, &input, &ParentRef::Component(form.clone()), 0)
            .unwrap();

        assert_eq!(store.component(&form).unwrap().children, vec![input.clone()]);
        assert_eq!(store.component(&input).unwrap().parent, ParentRef::Component(form));
        assert_eq!(store.current_page(&session).unwrap().components.len(), 1);
        store.snapshot().check_integrity().unwrap();
    }

    #[test]
    fn test_move_within_same_parent() {
        let (mut store, session) = store();
        let root = page_root(&session);
        let a = add(&mut store, &session, &root, ComponentType::Text);
        let b = add(&mut store, &session, &root, ComponentType::Text);
        let c = add(&mut store, &session, &root, ComponentType::Text);

        store.move_component(&session, &a, &root, 2).unwrap();
        assert_eq!(store.current_page(&session).unwrap().components, vec![b, c, a]);
    }

    #[test]
    fn test_duplicate_component_is_isomorphic_with_fresh_ids() {
        let (mut store, session) = store();
        let root = page_root(&session);
        let tail = add(&mut store, &session, &root, ComponentType::Button);
        let form = store
            .add_component(&session, &root, ComponentType::Form, Some(0))
            .unwrap()
            .id;
        let inside = ParentRef::Component(form.clone());
        add(&mut store, &session, &inside, ComponentType::Input);
        let nested = add(&mut store, &session, &inside, ComponentType::Container);
        add(&mut store, &session, &ParentRef::Component(nested), ComponentType::Text);
        let original_shape = shape(store.snapshot(), &form);

        let copy = store.duplicate_component(&session, &form).unwrap();

        let ws = store.snapshot();
        assert_eq!(shape(ws, &copy.id), original_shape);
        assert_eq!(shape(ws, &form), original_shape);
        let original_ids: BTreeSet<_> = ws.subtree(&form).into_iter().collect();
        let copy_ids: BTreeSet<_> = ws.subtree(&copy.id).into_iter().collect();
        assert_eq!(copy_ids.len(), 4);
        assert!(original_ids.is_disjoint(&copy_ids));
        assert_eq!(
            store.current_page(&session).unwrap().components,
            vec![form, copy.id, tail]
        );
        ws.check_integrity().unwrap();
    }

    #[test]
    fn test_delete_component_is_idempotent() {
        let (mut store, mut session) = store();
        let container = add(&mut store, &session, &page_root(&session), ComponentType::Container);
        let child = add(
            &mut store,
            &session,
            &ParentRef::Component(container.clone()),
            ComponentType::Text,
        );
        store.select_component(&mut session, &child).unwrap();

        store.delete_component(&mut session, &container).unwrap();
        let version = store.version();
        store.delete_component(&mut session, &container).unwrap();

        assert_eq!(store.version(), version);
        assert!(store.snapshot().components.is_empty());
        assert_eq!(session.selection(), &Selection::Unselected);
    }

    #[test]
    fn test_library_round_trip() {
        let (mut store, session) = store();
        let root = page_root(&session);
        let card = add(&mut store, &session, &root, ComponentType::Container);
        add(&mut store, &session, &ParentRef::Component(card.clone()), ComponentType::Text);

        let definition = store.save_to_library(&session, &card).unwrap();
        assert_eq!(store.current_app(&session).unwrap().components, vec![definition.id.clone()]);

        let instance = store
            .instantiate_from_library(&session, &definition.id, &root, None)
            .unwrap();
        assert_eq!(store.snapshot().subtree(&instance.id).len(), 2);

        let err = store
            .instantiate_from_library(&session, &card, &root, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
        store.snapshot().check_integrity().unwrap();
    }

    #[test]
    fn test_set_prop_requires_editing() {
        let (mut store, mut session) = store();
        let text = add(&mut store, &session, &page_root(&session), ComponentType::Text);

        let err = store.set_prop_text(&session, &text, "text", "Hello").unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        store.select_component(&mut session, &text).unwrap();
        assert!(store.set_prop_text(&session, &text, "text", "Hello").is_err());

        session.begin_edit().unwrap();
        store.set_prop_text(&session, &text, "text", "Hello {{ item.name }}").unwrap();
        assert!(matches!(
            store.component(&text).unwrap().props["text"],
            PropValue::Bound(Binding::Template { .. })
        ));
    }

    #[test]
    fn test_add_record_generates_only_uuid() {
        let (mut store, session) = store();
        let table = store.create_table(&session.current_app, "Users").unwrap();
        store.add_field(&table.id, "uid", FieldType::Uuid).unwrap();
        store.add_field(&table.id, "name", FieldType::Text).unwrap();

        let record = store.add_record(&table.id, BTreeMap::new()).unwrap();
        let uid = record.values["uid"].as_str().unwrap();
        assert!(!uid.is_empty());
        assert!(uuid::Uuid::parse_str(uid).is_ok());
        assert_eq!(record.values["name"], json!(""));

        let second = store.add_record(&table.id, BTreeMap::new()).unwrap();
        assert_ne!(second.values["uid"], record.values["uid"]);
    }

    #[test]
    fn test_table_and_field_names_are_unique() {
        let (mut store, session) = store();
        let table = store.create_table(&session.current_app, "Users").unwrap();
        assert!(matches!(
            store.create_table(&session.current_app, "Users"),
            Err(DomainError::Validation(_))
        ));

        store.add_field(&table.id, "email", FieldType::Text).unwrap();
        assert!(matches!(
            store.add_field(&table.id, "email", FieldType::Number),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(store.table(&table.id).unwrap().fields.len(), 1);
    }

    #[test]
    fn test_remove_then_re_add_field_does_not_resurrect_values() {
        let (mut store, session) = store();
        let table = store.create_table(&session.current_app, "Notes").unwrap();
        store.add_field(&table.id, "title", FieldType::Text).unwrap();
        store.add_field(&table.id, "body", FieldType::Text).unwrap();
        store
            .add_record(
                &table.id,
                BTreeMap::from([
                    ("title".to_string(), json!("First")),
                    ("body".to_string(), json!("secret")),
                ]),
            )
            .unwrap();

        store.remove_field(&table.id, "body").unwrap();
        store.remove_field(&table.id, "body").unwrap();
        let record = &store.table(&table.id).unwrap().records[0];
        assert!(!record.values.contains_key("body"));
        assert_eq!(record.values["title"], json!("First"));

        store.add_field(&table.id, "body", FieldType::Text).unwrap();
        assert_eq!(store.table(&table.id).unwrap().records[0].values["body"], json!(""));
    }

    #[test]
    fn test_remove_field_trims_name() {
        let (mut store, session) = store();
        let table = store.create_table(&session.current_app, "Notes").unwrap();
        store.add_field(&table.id, " body ", FieldType::Text).unwrap();
        store.add_record(&table.id, BTreeMap::new()).unwrap();

        store.remove_field(&table.id, "  body").unwrap();
        let table = store.table(&table.id).unwrap();
        assert!(table.field("body").is_none());
        assert!(!table.records[0].values.contains_key("body"));
    }

    #[test]
    fn test_update_and_delete_record() {
        let (mut store, session) = store();
        let table = store.create_table(&session.current_app, "Tasks").unwrap();
        store.add_field(&table.id, "done", FieldType::Boolean).unwrap();
        let record = store.add_record(&table.id, BTreeMap::new()).unwrap();
        assert_eq!(record.values["done"], Value::Null);

        let updated = store
            .update_record(
                &table.id,
                &record.id,
                BTreeMap::from([("done".to_string(), json!(true))]),
            )
            .unwrap();
        assert_eq!(updated.values["done"], json!(true));

        store.delete_record(&table.id, &record.id).unwrap();
        store.delete_record(&table.id, &record.id).unwrap();
        assert!(store.table(&table.id).unwrap().records.is_empty());
    }

    #[test]
    fn test_import_is_all_or_nothing() {
        let (mut store, session) = store();
        let table = store.create_table(&session.current_app, "People").unwrap();
        store.add_field(&table.id, "name", FieldType::Text).unwrap();
        store.add_field(&table.id, "age", FieldType::Number).unwrap();

        assert!(store.import_records_csv(&table.id, "name,age\nAda,36\nBob,old\n").is_err());
        assert!(store.table(&table.id).unwrap().records.is_empty());

        let imported = store.import_records_csv(&table.id, "name,age\nAda,36\nBob,\n").unwrap();
        assert_eq!(imported.len(), 2);
        assert_eq!(store.export_records_csv(&table.id).unwrap(), "name,age\nAda,36\nBob,\n");
    }

    #[test]
    fn test_submit_form_adds_record() {
        let (mut store, mut session) = store();
        let table = store.create_table(&session.current_app, "Leads").unwrap();
        store.add_field(&table.id, "email", FieldType::Text).unwrap();
        let form = add(&mut store, &session, &page_root(&session), ComponentType::Form);

        let values = BTreeMap::from([("email".to_string(), json!("a@b.c"))]);
        assert!(matches!(
            store.submit_form(&session, &form, values.clone()),
            Err(DomainError::Validation(_))
        ));

        store.select_component(&mut session, &form).unwrap();
        session.begin_edit().unwrap();
        store.set_prop(&session, &form, "table", PropValue::Static(json!("Leads"))).unwrap();

        let record = store.submit_form(&session, &form, values).unwrap();
        assert_eq!(record.values["email"], json!("a@b.c"));
        assert_eq!(store.table(&table.id).unwrap().records.len(), 1);
    }

    #[test]
    fn test_resolve_binding_and_render_props() {
        let (mut store, mut session) = store();
        let table = store.create_table(&session.current_app, "Users").unwrap();
        store.add_field(&table.id, "name", FieldType::Text).unwrap();
        store
            .add_record(&table.id, BTreeMap::from([("name".to_string(), json!("Ada"))]))
            .unwrap();

        let value = store
            .resolve_binding(
                &session,
                &Binding::parse("{{ Users[0].name }}").unwrap(),
                &RenderContext::default(),
            )
            .unwrap();
        assert_eq!(value, json!("Ada"));

        let text = add(&mut store, &session, &page_root(&session), ComponentType::Text);
        store.select_component(&mut session, &text).unwrap();
        session.begin_edit().unwrap();
        store.set_prop_text(&session, &text, "text", "{{ Ghosts.name }}").unwrap();

        let props = store.render_props(&session, &text, &RenderContext::default()).unwrap();
        assert_eq!(props["text"].value, Value::Null);
        assert!(props["text"].warning.is_some());
    }

    #[test]
    fn test_repeater_contexts_follow_source() {
        let (mut store, mut session) = store();
        let table = store.create_table(&session.current_app, "Users").unwrap();
        store.add_field(&table.id, "name", FieldType::Text).unwrap();
        for name in ["Ada", "Grace"] {
            store
                .add_record(&table.id, BTreeMap::from([("name".to_string(), json!(name))]))
                .unwrap();
        }
        let repeater = add(&mut store, &session, &page_root(&session), ComponentType::Repeater);
        assert!(store.repeater_contexts(&session, &repeater).unwrap().is_empty());

        store.select_component(&mut session, &repeater).unwrap();
        session.begin_edit().unwrap();
        store.set_prop_text(&session, &repeater, "source", "{{ Users }}").unwrap();

        let contexts = store.repeater_contexts(&session, &repeater).unwrap();
        let label = Binding::parse("{{ item.name }}").unwrap();
        let names: Vec<_> = contexts
            .iter()
            .map(|ctx| store.resolve_binding(&session, &label, ctx).unwrap())
            .collect();
        assert_eq!(names, vec![json!("Ada"), json!("Grace")]);
    }

    #[test]
    fn test_delete_app_cascades_and_switches_session() {
        let (mut store, mut session) = store();
        let first = session.current_app.clone();
        assert!(matches!(
            store.delete_app(&mut session, &first),
            Err(DomainError::Validation(_))
        ));

        let shop = store.create_app(&mut session, "Shop", None).unwrap();
        store.create_table(&shop.id, "Orders").unwrap();
        add(&mut store, &session, &page_root(&session), ComponentType::Text);

        store.delete_app(&mut session, &shop.id).unwrap();
        assert_eq!(session.current_app, first);
        assert_eq!(session.current_page, PageId::from("page-1"));
        let ws = store.snapshot();
        assert_eq!(ws.apps.len(), 1);
        assert!(ws.tables.is_empty());
        assert!(ws.components.is_empty());
        ws.check_integrity().unwrap();
    }

    #[test]
    fn test_delete_page_keeps_one_page() {
        let (mut store, mut session) = store();
        let app_id = session.current_app.clone();
        let home = session.current_page.clone();
        assert!(store.delete_page(&mut session, &home).is_err());

        let about = store.create_page(&app_id, "About", "/about").unwrap();
        store.select_page(&mut session, &about.id).unwrap();
        store.delete_page(&mut session, &about.id).unwrap();
        assert_eq!(session.current_page, home);
    }

    #[test]
    fn test_undo_redo() {
        let (mut store, mut session) = store();
        let text = add(&mut store, &session, &page_root(&session), ComponentType::Text);
        store.select_component(&mut session, &text).unwrap();

        assert!(store.undo(&mut session).unwrap());
        assert!(store.snapshot().components.is_empty());
        assert_eq!(session.selection(), &Selection::Unselected);

        assert!(store.redo(&mut session).unwrap());
        assert!(store.component(&text).is_ok());
        assert!(!store.redo(&mut session).unwrap());

        let fresh = add(&mut store, &session, &page_root(&session), ComponentType::Button);
        assert_ne!(fresh, text);
        assert!(!store.can_redo());
    }

    #[test]
    fn test_undo_limit() {
        let mut store = Store::open(MemorySink::default(), 2).unwrap();
        let mut session = store.default_session().unwrap();
        for _ in 0..4 {
            add(&mut store, &session, &page_root(&session), ComponentType::Text);
        }
        assert!(store.undo(&mut session).unwrap());
        assert!(store.undo(&mut session).unwrap());
        assert!(!store.undo(&mut session).unwrap());
        assert_eq!(store.current_page(&session).unwrap().components.len(), 2);
    }

    #[test]
    fn test_every_mutation_is_flushed_and_broadcast() {
        let (mut store, session) = store();
        let events = store.subscribe();
        let table = store.create_table(&session.current_app, "Users").unwrap();
        store.add_field(&table.id, "name", FieldType::Text).unwrap();
        assert!(store.create_table(&session.current_app, "Users").is_err());

        assert_eq!(store.persistence().flushed_versions, vec![1, 2]);
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                StoreEvent::Changed { version: 1, change: Change::TableCreated(table.id.clone()) },
                StoreEvent::Changed {
                    version: 2,
                    change: Change::FieldAdded { table: table.id, field: "name".to_string() },
                },
            ]
        );
    }

    struct FailingSink;

    impl SnapshotSink for FailingSink {
        fn hydrate(&mut self) -> DomainResult<Workspace> {
            Ok(Workspace::seeded("Offline"))
        }

        fn flush(&mut self, _snapshot: &Workspace) -> DomainResult<()> {
            Err(DomainError::Persistence("quota exceeded".to_string()))
        }
    }

    #[test]
    fn test_flush_failure_degrades_to_memory() {
        let mut store = Store::open(FailingSink, DEFAULT_UNDO_LIMIT).unwrap();
        let session = store.default_session().unwrap();
        let events = store.subscribe();

        let text = store
            .add_component(&session, &page_root(&session), ComponentType::Text, None)
            .unwrap();
        assert!(store.component(&text.id).is_ok());

        let warnings = store.take_warnings();
        assert_eq!(warnings, vec![DomainError::Persistence("quota exceeded".to_string())]);
        let received: Vec<_> = events.try_iter().collect();
        assert!(matches!(received[0], StoreEvent::PersistenceWarning { .. }));
        assert!(matches!(received[1], StoreEvent::Changed { version: 1, .. }));
    }

    #[test]
    fn test_unwritable_seed_opens_in_memory() {
        let backend = MemoryKeyValueStore::with_quota(50);
        let adapter = PersistenceAdapter::new(backend.clone(), "p", "App");
        let mut store = Store::open(adapter, DEFAULT_UNDO_LIMIT).unwrap();

        assert_eq!(store.apps().count(), 1);
        let warnings = store.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            &warnings[0],
            DomainError::Persistence(message) if message.contains("quota exceeded")
        ));

        let session = store.default_session().unwrap();
        store
            .add_component(&session, &page_root(&session), ComponentType::Text, None)
            .unwrap();
        assert_eq!(store.snapshot().version, 1);
        assert_eq!(store.take_warnings().len(), 1);
        assert!(backend.is_empty());
    }
}
