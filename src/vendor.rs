//! Vendor project metadata (`Metadata/model_settings.config`)
//!
//! Bambu Studio and its forks keep per-object names, extruder assignments,
//! plate membership and an "assemble" pose per object in an XML side file.
//! Plate numbering there (`plater_id`) is independent of build-item order,
//! so every lookup that needs "the slicer's plate N" goes through this module.

use crate::affine::{Affine3x4, TRANSFORM_TOKENS};
use crate::archive::{MODEL_SETTINGS_PATH, Package};
use crate::error::{Error, Result};
use crate::xml::{XML_BUFFER_CAPACITY, attr, element_name, parse_attributes};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{Read, Seek};

/// One `<plate>` entry
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VendorPlate {
    /// `plater_id` metadata
    pub plater_id: Option<u32>,
    /// `plater_name` metadata, trimmed
    pub name: Option<String>,
    /// Object ids listed by the plate's `<model_instance>` entries
    pub object_ids: Vec<String>,
}

/// One `<assemble_item>` entry
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembleItem {
    /// `object_id` attribute
    pub object_id: Option<String>,
    /// Raw `transform` attribute
    pub transform_text: Option<String>,
}

impl AssembleItem {
    /// The transform when it is a well-formed twelve-value 3MF matrix
    pub fn transform(&self) -> Option<Affine3x4> {
        let text = self.transform_text.as_deref()?;
        if text.split_whitespace().count() != TRANSFORM_TOKENS {
            return None;
        }
        Affine3x4::try_parse(text)
    }
}

/// Parsed `model_settings.config`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelSettings {
    /// Object id → display name
    pub object_names: BTreeMap<String, String>,
    /// Object id → object-level `extruder` value
    pub object_extruders: BTreeMap<String, String>,
    /// Every `extruder` value in the document, including per-part ones
    pub extruder_values: Vec<String>,
    /// Plates in document order
    pub plates: Vec<VendorPlate>,
    /// Assemble items in document order
    pub assemble: Vec<AssembleItem>,
}

impl ModelSettings {
    /// Parse the XML text of `model_settings.config`
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut settings = ModelSettings::default();
        let mut stack: Vec<String> = Vec::new();
        let mut object_id: Option<String> = None;
        let mut plate: Option<VendorPlate> = None;
        let mut buf = Vec::with_capacity(XML_BUFFER_CAPACITY);

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let name = element_name(e)?.to_string();
                    settings.open(e, &name, &stack, &mut object_id, &mut plate)?;
                    stack.push(name);
                }
                Ok(Event::Empty(ref e)) => {
                    let name = element_name(e)?.to_string();
                    settings.open(e, &name, &stack, &mut object_id, &mut plate)?;
                    settings.close(&name, &mut object_id, &mut plate);
                }
                Ok(Event::End(ref e)) => {
                    let name = std::str::from_utf8(e.local_name().into_inner())
                        .map_err(|err| Error::malformed(MODEL_SETTINGS_PATH, err))?
                        .to_string();
                    stack.pop();
                    settings.close(&name, &mut object_id, &mut plate);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(Error::malformed(MODEL_SETTINGS_PATH, e)),
                _ => {}
            }
            buf.clear();
        }

        Ok(settings)
    }

    /// Read and parse the side file; `Ok(None)` when the archive has none
    pub fn load<R: Read + Seek>(package: &mut Package<R>) -> Result<Option<Self>> {
        match package.read_string_opt(MODEL_SETTINGS_PATH)? {
            Some(xml) => Self::parse(&xml).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`ModelSettings::load`], treating an unreadable side file as absent
    pub fn load_or_warn<R: Read + Seek>(package: &mut Package<R>) -> Option<Self> {
        Self::load(package).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring unreadable model_settings.config");
            None
        })
    }

    fn open(
        &mut self,
        e: &BytesStart<'_>,
        name: &str,
        stack: &[String],
        object_id: &mut Option<String>,
        plate: &mut Option<VendorPlate>,
    ) -> Result<()> {
        let parent = stack.last().map(String::as_str);
        match name {
            "object" if parent == Some("config") => {
                let attrs = parse_attributes(e)?;
                *object_id = attr(&attrs, "id").map(str::to_string);
            }
            "plate" if parent == Some("config") => {
                *plate = Some(VendorPlate::default());
            }
            "assemble_item" => {
                let attrs = parse_attributes(e)?;
                self.assemble.push(AssembleItem {
                    object_id: attr(&attrs, "object_id").map(str::to_string),
                    transform_text: attr(&attrs, "transform").map(str::to_string),
                });
            }
            "metadata" => {
                let attrs = parse_attributes(e)?;
                let key = attr(&attrs, "key").unwrap_or_default();
                let value = attr(&attrs, "value").unwrap_or_default();
                self.metadata(parent, key, value, object_id.as_deref(), plate);
            }
            _ => {}
        }
        Ok(())
    }

    fn metadata(
        &mut self,
        parent: Option<&str>,
        key: &str,
        value: &str,
        object_id: Option<&str>,
        plate: &mut Option<VendorPlate>,
    ) {
        if key == "extruder" {
            self.extruder_values.push(value.trim().to_string());
        }
        match (parent, key) {
            (Some("object"), "name") => {
                let name = value.trim();
                if let (Some(id), false) = (object_id, name.is_empty()) {
                    self.object_names.insert(id.to_string(), name.to_string());
                }
            }
            (Some("object"), "extruder") => {
                if let Some(id) = object_id {
                    self.object_extruders
                        .insert(id.to_string(), value.trim().to_string());
                }
            }
            (Some("plate"), "plater_id") => {
                if let Some(p) = plate.as_mut() {
                    p.plater_id = value.trim().parse().ok();
                }
            }
            (Some("plate"), "plater_name") => {
                if let Some(p) = plate.as_mut() {
                    let name = value.trim();
                    p.name = (!name.is_empty()).then(|| name.to_string());
                }
            }
            (Some("model_instance"), "object_id") => {
                if let Some(p) = plate.as_mut() {
                    p.object_ids.push(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &str, object_id: &mut Option<String>, plate: &mut Option<VendorPlate>) {
        match name {
            "object" => *object_id = None,
            "plate" => {
                if let Some(p) = plate.take() {
                    self.plates.push(p);
                }
            }
            _ => {}
        }
    }

    /// Plate name for a `plater_id`
    pub fn plate_name(&self, plater_id: u32) -> Option<&str> {
        self.plates
            .iter()
            .find(|p| p.plater_id == Some(plater_id))
            .and_then(|p| p.name.as_deref())
    }

    /// The `plater_id` of the plate whose instances include `object_id`
    ///
    /// Callers fall back to plate 1 when this is `None`.
    pub fn bambu_plate_for_object(&self, object_id: &str) -> Option<u32> {
        self.plates
            .iter()
            .find(|p| p.object_ids.iter().any(|id| id == object_id))
            .and_then(|p| p.plater_id)
    }

    /// Assemble transform by 1-based position among items carrying a transform
    pub fn assemble_transform_by_index(&self, index: usize) -> Option<Affine3x4> {
        if index == 0 {
            return None;
        }
        self.assemble
            .iter()
            .filter(|a| a.transform_text.is_some())
            .nth(index - 1)
            .and_then(AssembleItem::transform)
    }

    /// Object id of the assemble item at 1-based document position
    pub fn assemble_object_id_by_index(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.assemble
            .get(index - 1)
            .and_then(|a| a.object_id.as_deref())
    }

    /// Assemble transforms keyed by object id
    ///
    /// Object ids that appear on more than one well-formed assemble item are
    /// ambiguous and left out.
    pub fn assemble_transforms_by_object(&self) -> BTreeMap<String, Affine3x4> {
        let mut by_object = BTreeMap::new();
        let mut duplicates = HashSet::new();
        for item in &self.assemble {
            let (Some(id), Some(t)) = (item.object_id.as_ref(), item.transform()) else {
                continue;
            };
            if by_object.contains_key(id) {
                duplicates.insert(id.clone());
            } else {
                by_object.insert(id.clone(), t);
            }
        }
        for id in duplicates {
            by_object.remove(&id);
        }
        by_object
    }

    /// Assemble transform for one object when it is unambiguous
    pub fn assemble_transform_by_object(&self, object_id: &str) -> Option<Affine3x4> {
        self.assemble_transforms_by_object().remove(object_id)
    }

    /// Distinct extruder values across objects and parts
    pub fn distinct_extruders(&self) -> BTreeSet<&str> {
        self.extruder_values
            .iter()
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Highest integer extruder value, at least 1
    pub fn max_extruder(&self) -> u32 {
        self.extruder_values
            .iter()
            .filter_map(|v| v.parse::<u32>().ok())
            .max()
            .unwrap_or(1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<config>
  <object id="2">
    <metadata key="name" value="Benchy"/>
    <metadata key="extruder" value="1"/>
    <part id="1" subtype="normal_part">
      <metadata key="name" value="hull"/>
      <metadata key="extruder" value="3"/>
    </part>
  </object>
  <object id="4">
    <metadata key="name" value="  "/>
    <metadata key="extruder" value="1"/>
  </object>
  <plate>
    <metadata key="plater_id" value="1"/>
    <metadata key="plater_name" value="Hulls"/>
    <model_instance>
      <metadata key="object_id" value="4"/>
    </model_instance>
  </plate>
  <plate>
    <metadata key="plater_id" value="2"/>
    <metadata key="plater_name" value=""/>
    <model_instance>
      <metadata key="object_id" value="2"/>
      <metadata key="instance_id" value="0"/>
    </model_instance>
  </plate>
  <assemble>
    <assemble_item object_id="2" instance_id="0" transform="1 0 0 0 1 0 0 0 1 400 20 0" offset="0 0 0"/>
    <assemble_item object_id="4" instance_id="0"/>
    <assemble_item object_id="4" instance_id="0" transform="1 0 0 0 1 0 0 0 1 1 2"/>
    <assemble_item object_id="6" instance_id="0" transform="1 0 0 0 1 0 0 0 1 7 8 9"/>
    <assemble_item object_id="6" instance_id="1" transform="1 0 0 0 1 0 0 0 1 7 8 9"/>
  </assemble>
</config>"#;

    #[test]
    fn test_names_and_extruders() {
        let ms = ModelSettings::parse(SETTINGS).unwrap();
        assert_eq!(ms.object_names.get("2").map(String::as_str), Some("Benchy"));
        // the part name does not override the object name, blank names are skipped
        assert!(!ms.object_names.contains_key("4"));
        assert_eq!(ms.object_extruders.get("2").map(String::as_str), Some("1"));
        assert_eq!(ms.distinct_extruders().len(), 2);
        assert_eq!(ms.max_extruder(), 3);
    }

    #[test]
    fn test_plates() {
        let ms = ModelSettings::parse(SETTINGS).unwrap();
        assert_eq!(ms.plates.len(), 2);
        assert_eq!(ms.plate_name(1), Some("Hulls"));
        assert_eq!(ms.plate_name(2), None);
        assert_eq!(ms.bambu_plate_for_object("2"), Some(2));
        assert_eq!(ms.bambu_plate_for_object("9"), None);
    }

    #[test]
    fn test_assemble_lookups() {
        let ms = ModelSettings::parse(SETTINGS).unwrap();
        // position counts only items that carry a transform
        let first = ms.assemble_transform_by_index(1).unwrap();
        assert_eq!(first.translation(), [400.0, 20.0, 0.0]);
        // eleven tokens: counted but not usable
        assert!(ms.assemble_transform_by_index(2).is_none());
        assert_eq!(ms.assemble_transform_by_index(3).unwrap().translation()[2], 9.0);

        // object-id positions count every item
        assert_eq!(ms.assemble_object_id_by_index(2), Some("4"));
        assert_eq!(ms.assemble_object_id_by_index(9), None);

        let by_object = ms.assemble_transforms_by_object();
        assert!(by_object.contains_key("2"));
        // object 4 has only a malformed transform, object 6 is duplicated
        assert!(!by_object.contains_key("4"));
        assert!(!by_object.contains_key("6"));
    }

    #[test]
    fn test_malformed_settings() {
        assert!(ModelSettings::parse("<config><object></config>").is_err());
    }
}
