//! Page and slice result windows
//!
//! A `Page` carries total counts (two store operations: content + count);
//! a `Slice` only knows whether a next window exists, derived from a
//! one-ahead probe row, which is the whole reason it is cheaper.

use serde::Serialize;

use crate::error::{DmError, DmResult};

/// A validated page request. Page numbers are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    number: i64,
    size: i64,
}

impl PageRequest {
    /// Build a request, rejecting non-positive sizes and negative pages.
    pub fn of(number: i64, size: i64) -> DmResult<Self> {
        if size <= 0 || number < 0 {
            return Err(DmError::InvalidPageRequest { page: number, size });
        }
        Ok(Self { number, size })
    }

    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Store offset for the content query.
    pub fn offset(&self) -> i64 {
        self.number * self.size
    }

    /// The request for the following window.
    pub fn next(&self) -> Self {
        Self {
            number: self.number + 1,
            size: self.size,
        }
    }
}

/// A bounded, sorted result window with totals.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub number: i64,
    pub size: i64,
    pub total_elements: i64,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: PageRequest, total_elements: i64) -> Self {
        Self {
            content,
            number: request.number(),
            size: request.size(),
            total_elements,
        }
    }

    pub fn total_pages(&self) -> i64 {
        if self.total_elements == 0 {
            0
        } else {
            (self.total_elements + self.size - 1) / self.size
        }
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn is_last(&self) -> bool {
        self.number >= self.total_pages() - 1
    }

    pub fn has_next(&self) -> bool {
        !self.is_last()
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    /// Map page content into another shape, keeping the window metadata.
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// A count-free result window exposing only a next-page signal.
#[derive(Debug, Clone, Serialize)]
pub struct Slice<T> {
    pub content: Vec<T>,
    pub number: i64,
    pub size: i64,
    pub has_next: bool,
}

impl<T> Slice<T> {
    pub fn new(content: Vec<T>, request: PageRequest, has_next: bool) -> Self {
        Self {
            content,
            number: request.number(),
            size: request.size(),
            has_next,
        }
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            has_next: self.has_next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_validation() {
        assert!(PageRequest::of(0, 3).is_ok());
        assert!(matches!(
            PageRequest::of(0, 0),
            Err(DmError::InvalidPageRequest { .. })
        ));
        assert!(matches!(
            PageRequest::of(-1, 3),
            Err(DmError::InvalidPageRequest { .. })
        ));
    }

    #[test]
    fn test_page_request_offset() {
        let request = PageRequest::of(2, 10).unwrap();
        assert_eq!(request.offset(), 20);
        assert_eq!(request.next().offset(), 30);
    }

    #[test]
    fn test_page_arithmetic() {
        let request = PageRequest::of(0, 3).unwrap();
        let page = Page::new(vec![1, 2, 3], request, 5);

        assert_eq!(page.total_pages(), 2);
        assert!(page.is_first());
        assert!(!page.is_last());
        assert!(page.has_next());
        assert!(!page.has_previous());
    }

    #[test]
    fn test_last_page() {
        let request = PageRequest::of(1, 3).unwrap();
        let page = Page::new(vec![4, 5], request, 5);

        assert!(page.is_last());
        assert!(!page.has_next());
        assert!(page.has_previous());
    }

    #[test]
    fn test_empty_page_past_the_end() {
        let request = PageRequest::of(9, 3).unwrap();
        let page = Page::new(Vec::<i64>::new(), request, 5);

        assert_eq!(page.total_elements, 5);
        assert_eq!(page.total_pages(), 2);
        assert!(page.content.is_empty());
    }

    #[test]
    fn test_page_map_keeps_window() {
        let request = PageRequest::of(0, 2).unwrap();
        let page = Page::new(vec![1, 2], request, 4).map(|n| n * 10);

        assert_eq!(page.content, vec![10, 20]);
        assert_eq!(page.total_elements, 4);
        assert_eq!(page.total_pages(), 2);
    }

    #[test]
    fn test_slice() {
        let request = PageRequest::of(0, 3).unwrap();
        let slice = Slice::new(vec![1, 2, 3], request, true);

        assert!(slice.has_next);
        assert!(slice.is_first());
        assert_eq!(slice.content.len(), 3);
    }

    #[test]
    fn test_page_serializes() {
        let request = PageRequest::of(0, 2).unwrap();
        let page = Page::new(vec![1, 2], request, 3);
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["total_elements"], 3);
        assert_eq!(json["content"].as_array().unwrap().len(), 2);
    }
}
