//! The complete, serializable state of one builder workspace.
//!
//! Components live in a single arena keyed by id. Ownership is expressed by
//! each component's `parent` plus the ordered child lists of pages, library
//! roots and container components, so "is descendant of" checks only walk
//! parent links.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::errors::{DomainError, DomainResult};
use super::models::{App, AppId, Component, ComponentId, Page, PageId, ParentRef, Table, TableId};

/// Name given to the app created on first run.
pub const DEFAULT_APP_NAME: &str = "Untitled App";
pub const DEFAULT_PAGE_NAME: &str = "Home";
pub const DEFAULT_PAGE_PATH: &str = "/";

/// The snapshot handed to persistence and to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Bumped on every committed mutation; orders flushes.
    pub version: u64,
    /// Next value of the id sequence shared by apps, pages, components and tables.
    pub next_seq: u64,
    pub app_order: Vec<AppId>,
    pub apps: BTreeMap<AppId, App>,
    pub pages: BTreeMap<PageId, Page>,
    pub components: BTreeMap<ComponentId, Component>,
    pub tables: BTreeMap<TableId, Table>,
}

impl Workspace {
    /// A workspace holding nothing. Not valid on its own: every session needs an app.
    pub fn empty() -> Self {
        Self {
            version: 0,
            next_seq: 1,
            app_order: Vec::new(),
            apps: BTreeMap::new(),
            pages: BTreeMap::new(),
            components: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    /// The deterministic first-run state: `app-1` owning the `page-1` home page.
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft::domain::{AppId, PageId, Workspace};
    ///
    /// let workspace = Workspace::seeded("My App");
    /// let app = &workspace.apps[&AppId::from("app-1")];
    /// assert_eq!(app.pages, vec![PageId::from("page-1")]);
    /// assert_eq!(workspace.pages[&PageId::from("page-1")].path, "/");
    /// ```
    pub fn seeded(app_name: &str) -> Self {
        let app_id = AppId::new(format!("{}-1", AppId::PREFIX));
        let page_id = PageId::new(format!("{}-1", PageId::PREFIX));

        let mut workspace = Self::empty();
        workspace.next_seq = 2;
        workspace.app_order.push(app_id.clone());
        workspace.pages.insert(
            page_id.clone(),
            Page {
                id: page_id.clone(),
                app_id: app_id.clone(),
                name: DEFAULT_PAGE_NAME.to_string(),
                path: DEFAULT_PAGE_PATH.to_string(),
                components: Vec::new(),
            },
        );
        workspace.apps.insert(
            app_id.clone(),
            App {
                id: app_id,
                name: app_name.to_string(),
                description: None,
                pages: vec![page_id],
                components: Vec::new(),
                tables: Vec::new(),
            },
        );
        workspace
    }

    /// Draws the next id for an entity kind, e.g. `comp-12`.
    pub fn allocate_id(&mut self, prefix: &str) -> String {
        let id = format!("{prefix}-{}", self.next_seq);
        self.next_seq += 1;
        id
    }

    pub fn app(&self, id: &AppId) -> DomainResult<&App> {
        self.apps.get(id).ok_or_else(|| DomainError::not_found("app", id))
    }

    pub fn app_mut(&mut self, id: &AppId) -> DomainResult<&mut App> {
        self.apps.get_mut(id).ok_or_else(|| DomainError::not_found("app", id))
    }

    pub fn page(&self, id: &PageId) -> DomainResult<&Page> {
        self.pages.get(id).ok_or_else(|| DomainError::not_found("page", id))
    }

    pub fn page_mut(&mut self, id: &PageId) -> DomainResult<&mut Page> {
        self.pages.get_mut(id).ok_or_else(|| DomainError::not_found("page", id))
    }

    pub fn component(&self, id: &ComponentId) -> DomainResult<&Component> {
        self.components
            .get(id)
            .ok_or_else(|| DomainError::not_found("component", id))
    }

    pub fn component_mut(&mut self, id: &ComponentId) -> DomainResult<&mut Component> {
        self.components
            .get_mut(id)
            .ok_or_else(|| DomainError::not_found("component", id))
    }

    pub fn table(&self, id: &TableId) -> DomainResult<&Table> {
        self.tables.get(id).ok_or_else(|| DomainError::not_found("table", id))
    }

    pub fn table_mut(&mut self, id: &TableId) -> DomainResult<&mut Table> {
        self.tables.get_mut(id).ok_or_else(|| DomainError::not_found("table", id))
    }

    pub fn table_by_name(&self, app_id: &AppId, name: &str) -> Option<&Table> {
        let app = self.apps.get(app_id)?;
        app.tables
            .iter()
            .filter_map(|id| self.tables.get(id))
            .find(|table| table.name == name)
    }

    pub fn page_by_path(&self, app_id: &AppId, path: &str) -> Option<&Page> {
        let app = self.apps.get(app_id)?;
        app.pages
            .iter()
            .filter_map(|id| self.pages.get(id))
            .find(|page| page.path == path)
    }

    /// The app a parent slot belongs to.
    pub fn app_of_parent(&self, parent: &ParentRef) -> DomainResult<AppId> {
        match parent {
            ParentRef::Page(id) => Ok(self.page(id)?.app_id.clone()),
            ParentRef::Component(id) => self.app_of_component(id),
            ParentRef::Library(id) => Ok(self.app(id)?.id.clone()),
        }
    }

    /// Walks parent links up to the owning page or library.
    pub fn app_of_component(&self, id: &ComponentId) -> DomainResult<AppId> {
        let mut current = self.component(id)?;
        for _ in 0..=self.components.len() {
            match &current.parent {
                ParentRef::Component(parent) => current = self.component(parent)?,
                root => return self.app_of_parent(root),
            }
        }
        Err(DomainError::Cycle(format!("component '{id}' has no root")))
    }

    /// True when `candidate` is `ancestor` or sits somewhere below it.
    pub fn is_descendant(&self, candidate: &ComponentId, ancestor: &ComponentId) -> bool {
        let mut current = candidate.clone();
        for _ in 0..=self.components.len() {
            if &current == ancestor {
                return true;
            }
            match self.components.get(&current).map(|c| &c.parent) {
                Some(ParentRef::Component(parent)) => current = parent.clone(),
                _ => return false,
            }
        }
        false
    }

    /// Ids of the subtree rooted at `root`, in pre-order.
    pub fn subtree(&self, root: &ComponentId) -> Vec<ComponentId> {
        let mut ordered = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(id) = stack.pop() {
            if let Some(component) = self.components.get(&id) {
                stack.extend(component.children.iter().rev().cloned());
                ordered.push(id);
            }
        }
        ordered
    }

    pub fn children(&self, parent: &ParentRef) -> DomainResult<&Vec<ComponentId>> {
        match parent {
            ParentRef::Page(id) => Ok(&self.page(id)?.components),
            ParentRef::Component(id) => Ok(&self.component(id)?.children),
            ParentRef::Library(id) => Ok(&self.app(id)?.components),
        }
    }

    fn children_mut(&mut self, parent: &ParentRef) -> DomainResult<&mut Vec<ComponentId>> {
        match parent {
            ParentRef::Page(id) => Ok(&mut self.page_mut(id)?.components),
            ParentRef::Component(id) => Ok(&mut self.component_mut(id)?.children),
            ParentRef::Library(id) => Ok(&mut self.app_mut(id)?.components),
        }
    }

    /// Checks that `parent` exists and may own children.
    pub fn check_parent(&self, parent: &ParentRef) -> DomainResult<()> {
        if let ParentRef::Component(id) = parent {
            let component = self.component(id)?;
            if !component.component_type.accepts_children() {
                return Err(DomainError::validation(format!(
                    "{} component '{}' cannot contain children",
                    component.component_type, id
                )));
            }
        } else {
            self.children(parent)?;
        }
        Ok(())
    }

    /// Places an already-stored component under `parent`. `None` or an index
    /// past the end appends.
    pub fn attach(
        &mut self,
        id: &ComponentId,
        parent: &ParentRef,
        index: Option<usize>,
    ) -> DomainResult<()> {
        let children = self.children_mut(parent)?;
        let position = index.unwrap_or(children.len()).min(children.len());
        children.insert(position, id.clone());
        self.component_mut(id)?.parent = parent.clone();
        Ok(())
    }

    /// Removes `id` from its parent's child list, returning its former position.
    pub fn detach(&mut self, id: &ComponentId) -> DomainResult<usize> {
        let parent = self.component(id)?.parent.clone();
        let children = self.children_mut(&parent)?;
        let position = children
            .iter()
            .position(|child| child == id)
            .ok_or_else(|| DomainError::not_found("component", format!("{id} under {parent}")))?;
        children.remove(position);
        Ok(position)
    }

    /// Detaches the subtree at `root` and drops every node in it.
    pub fn remove_subtree(&mut self, root: &ComponentId) -> DomainResult<Vec<ComponentId>> {
        self.detach(root)?;
        let removed = self.subtree(root);
        for id in &removed {
            self.components.remove(id);
        }
        Ok(removed)
    }

    /// Deep-copies the subtree at `source` with fresh ids and attaches the
    /// copy under `parent` at `index`.
    pub fn clone_subtree(
        &mut self,
        source: &ComponentId,
        parent: &ParentRef,
        index: Option<usize>,
    ) -> DomainResult<ComponentId> {
        let root = self.copy_nodes(source, parent.clone())?;
        self.attach(&root, parent, index)?;
        Ok(root)
    }

    fn copy_nodes(&mut self, source: &ComponentId, parent: ParentRef) -> DomainResult<ComponentId> {
        let original = self.component(source)?.clone();
        let id = ComponentId::new(self.allocate_id(ComponentId::PREFIX));
        let mut children = Vec::with_capacity(original.children.len());
        for child in &original.children {
            children.push(self.copy_nodes(child, ParentRef::Component(id.clone()))?);
        }
        self.components.insert(
            id.clone(),
            Component {
                id: id.clone(),
                component_type: original.component_type,
                props: original.props,
                parent,
                children,
            },
        );
        Ok(id)
    }

    /// Drops a page and its component tree and unlinks it from its app.
    pub fn remove_page(&mut self, id: &PageId) -> DomainResult<Page> {
        let page = self.pages.remove(id).ok_or_else(|| DomainError::not_found("page", id))?;
        for root in &page.components {
            for node in self.subtree(root) {
                self.components.remove(&node);
            }
        }
        if let Some(app) = self.apps.get_mut(&page.app_id) {
            app.pages.retain(|page_id| page_id != id);
        }
        Ok(page)
    }

    pub fn remove_table(&mut self, id: &TableId) -> DomainResult<Table> {
        let table = self.tables.remove(id).ok_or_else(|| DomainError::not_found("table", id))?;
        if let Some(app) = self.apps.get_mut(&table.app_id) {
            app.tables.retain(|table_id| table_id != id);
        }
        Ok(table)
    }

    /// Removes an app with everything it owns.
    pub fn remove_app(&mut self, id: &AppId) -> DomainResult<App> {
        let app = self.app(id)?.clone();
        for page in &app.pages {
            self.remove_page(page)?;
        }
        for table in &app.tables {
            self.remove_table(table)?;
        }
        for root in &app.components {
            for node in self.subtree(root) {
                self.components.remove(&node);
            }
        }
        self.apps.remove(id);
        self.app_order.retain(|app_id| app_id != id);
        Ok(app)
    }

    /// Verifies every structural invariant of the workspace.
    ///
    /// Run after hydrating persisted state so a corrupt snapshot is rejected
    /// instead of being operated on.
    pub fn check_integrity(&self) -> DomainResult<()> {
        let corrupt = |message: String| {
            Err(DomainError::Persistence(format!("corrupt workspace: {message}")))
        };

        if self.apps.is_empty() {
            return corrupt("no apps".to_string());
        }
        let ordered: BTreeSet<_> = self.app_order.iter().collect();
        if ordered.len() != self.app_order.len() || !ordered.iter().copied().eq(self.apps.keys()) {
            return corrupt("app order does not match apps".to_string());
        }

        let mut owned_pages = 0;
        let mut owned_tables = 0;
        let mut reached = BTreeSet::new();
        for (app_id, app) in &self.apps {
            if &app.id != app_id {
                return corrupt(format!("app keyed as '{app_id}' has id '{}'", app.id));
            }
            if app.pages.is_empty() {
                return corrupt(format!("app '{app_id}' has no pages"));
            }
            let mut paths = BTreeSet::new();
            for page_id in &app.pages {
                let Some(page) = self.pages.get(page_id) else {
                    return corrupt(format!("app '{app_id}' references missing page '{page_id}'"));
                };
                if &page.app_id != app_id || &page.id != page_id {
                    return corrupt(format!("page '{page_id}' is not owned by '{app_id}'"));
                }
                if !paths.insert(page.path.as_str()) {
                    return corrupt(format!("duplicate path '{}' in app '{app_id}'", page.path));
                }
                owned_pages += 1;
                let parent = ParentRef::Page(page_id.clone());
                self.check_children(&parent, &page.components, &mut reached)?;
            }
            let library = ParentRef::Library(app_id.clone());
            self.check_children(&library, &app.components, &mut reached)?;

            let mut names = BTreeSet::new();
            for table_id in &app.tables {
                let Some(table) = self.tables.get(table_id) else {
                    return corrupt(format!("app '{app_id}' references missing table '{table_id}'"));
                };
                if &table.app_id != app_id || &table.id != table_id {
                    return corrupt(format!("table '{table_id}' is not owned by '{app_id}'"));
                }
                if !names.insert(table.name.as_str()) {
                    return corrupt(format!("duplicate table name '{}'", table.name));
                }
                let mut fields = BTreeSet::new();
                if !table.fields.iter().all(|field| fields.insert(field.name.as_str())) {
                    return corrupt(format!("duplicate field in table '{table_id}'"));
                }
                owned_tables += 1;
            }
        }

        if owned_pages != self.pages.len() {
            return corrupt("orphaned pages".to_string());
        }
        if owned_tables != self.tables.len() {
            return corrupt("orphaned tables".to_string());
        }
        if reached.len() != self.components.len() {
            return corrupt("orphaned or shared components".to_string());
        }
        Ok(())
    }

    fn check_children(
        &self,
        parent: &ParentRef,
        children: &[ComponentId],
        reached: &mut BTreeSet<ComponentId>,
    ) -> DomainResult<()> {
        for child in children {
            let Some(component) = self.components.get(child) else {
                return Err(DomainError::Persistence(format!(
                    "corrupt workspace: {parent} references missing component '{child}'"
                )));
            };
            if &component.parent != parent || !reached.insert(child.clone()) {
                return Err(DomainError::Persistence(format!(
                    "corrupt workspace: component '{child}' is not a tree node of {parent}"
                )));
            }
            let node = ParentRef::Component(child.clone());
            self.check_children(&node, &component.children, reached)?;
        }
        Ok(())
    }
}
