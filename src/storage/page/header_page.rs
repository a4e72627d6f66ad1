use crate::buffer::PageId;

/// Catalog page pinned at page id 0: maps each index name to the page id of
/// its tree root so indexes can be reopened after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPage {
    pub records: Vec<(String, PageId)>,
}

impl HeaderPage {
    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(record_name, _)| record_name == name)
            .map(|(_, root_page_id)| *root_page_id)
    }

    /// Returns false when a record with this name already exists.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if self.get_record(name).is_some() {
            return false;
        }
        self.records.push((name.to_string(), root_page_id));
        true
    }

    /// Returns false when no record with this name exists.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        for (record_name, root) in self.records.iter_mut() {
            if record_name == name {
                *root = root_page_id;
                return true;
            }
        }
        false
    }

    pub fn upsert_record(&mut self, name: &str, root_page_id: PageId) {
        if !self.update_record(name, root_page_id) {
            self.records.push((name.to_string(), root_page_id));
        }
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|(record_name, _)| record_name != name);
        self.records.len() != before
    }
}
