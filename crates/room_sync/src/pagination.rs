#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    /// Distance in pixels between the viewport top and the oldest rendered
    /// message.
    pub offset_from_top: f32,
    pub scrolling_up: bool,
}

impl ScrollPosition {
    pub fn near_top(&self, threshold_px: f32) -> bool {
        self.scrolling_up && self.offset_from_top < threshold_px
    }
}

/// Pages are 1-indexed, page 1 being the newest.
#[derive(Debug, Clone)]
pub struct PaginationController {
    page_size: u32,
    top_threshold_px: f32,
    highest_page: u32,
    has_more: bool,
    in_flight: Option<u32>,
}

impl PaginationController {
    pub fn new(page_size: u32, top_threshold_px: f32) -> Self {
        Self {
            page_size: page_size.max(1),
            top_threshold_px,
            highest_page: 0,
            has_more: true,
            in_flight: None,
        }
    }

    pub fn highest_page(&self) -> u32 {
        self.highest_page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn should_request(&self, position: ScrollPosition) -> bool {
        position.near_top(self.top_threshold_px) && self.can_request()
    }

    pub fn can_request(&self) -> bool {
        self.has_more && self.in_flight.is_none()
    }

    pub fn begin_next(&mut self) -> Option<u32> {
        if !self.can_request() {
            return None;
        }
        let page = self.highest_page + 1;
        self.in_flight = Some(page);
        Some(page)
    }

    /// A short page latches `has_more` off for the rest of the room view.
    pub fn complete(&mut self, page: u32, received: usize) {
        if self.in_flight == Some(page) {
            self.in_flight = None;
        }
        self.highest_page = self.highest_page.max(page);
        if received < self.page_size as usize {
            self.has_more = false;
        }
    }

    /// A failed fetch leaves the cursor alone so the same page can be retried.
    pub fn fail(&mut self, page: u32) {
        if self.in_flight == Some(page) {
            self.in_flight = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UP_AT_TOP: ScrollPosition = ScrollPosition {
        offset_from_top: 10.0,
        scrolling_up: true,
    };

    #[test]
    fn full_first_page_keeps_more_available() {
        let mut pagination = PaginationController::new(20, 60.0);
        assert_eq!(pagination.begin_next(), Some(1));
        pagination.complete(1, 20);

        assert!(pagination.has_more());
        assert!(pagination.should_request(UP_AT_TOP));
        assert_eq!(pagination.begin_next(), Some(2));
    }

    #[test]
    fn short_page_exhausts_history_for_good() {
        let mut pagination = PaginationController::new(20, 60.0);
        assert_eq!(pagination.begin_next(), Some(1));
        pagination.complete(1, 5);

        assert!(!pagination.has_more());
        assert!(!pagination.should_request(UP_AT_TOP));
        assert_eq!(pagination.begin_next(), None);
    }

    #[test]
    fn in_flight_fetch_blocks_another_request() {
        let mut pagination = PaginationController::new(20, 60.0);
        assert_eq!(pagination.begin_next(), Some(1));
        assert!(!pagination.should_request(UP_AT_TOP));
        assert_eq!(pagination.begin_next(), None);
    }

    #[test]
    fn failure_allows_retrying_same_page() {
        let mut pagination = PaginationController::new(20, 60.0);
        pagination.begin_next();
        pagination.complete(1, 20);
        assert_eq!(pagination.begin_next(), Some(2));
        pagination.fail(2);

        assert!(pagination.has_more());
        assert_eq!(pagination.highest_page(), 1);
        assert_eq!(pagination.begin_next(), Some(2));
    }

    #[test]
    fn scroll_must_be_upward_and_within_threshold() {
        let pagination = PaginationController::new(20, 60.0);
        assert!(!pagination.should_request(ScrollPosition {
            offset_from_top: 10.0,
            scrolling_up: false,
        }));
        assert!(!pagination.should_request(ScrollPosition {
            offset_from_top: 60.0,
            scrolling_up: true,
        }));
        assert!(pagination.should_request(UP_AT_TOP));
    }
}
